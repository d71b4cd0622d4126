/// 流适配器的可观察阶段。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `Unconnected → Connected → {ReadHalfClosed | WriteHalfClosed} → Closed`；
/// - 两个半关闭标志相互独立，任意顺序都必须两者俱全才到达 `Closed`；
/// - `Errored` 可从任何非终止阶段到达，同时关闭两个方向；
/// - 从未建连的流被结束写方向时直接进入 `Closed`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketPhase {
    Unconnected,
    Connected,
    ReadHalfClosed,
    WriteHalfClosed,
    Closed,
    Errored,
}

impl SocketPhase {
    pub fn can_transition_to(self, target: SocketPhase) -> bool {
        use SocketPhase::*;
        matches!(
            (self, target),
            (Unconnected, Connected)
                | (Unconnected, Closed)
                | (Unconnected, Errored)
                | (Connected, ReadHalfClosed)
                | (Connected, WriteHalfClosed)
                | (Connected, Closed)
                | (Connected, Errored)
                | (ReadHalfClosed, Closed)
                | (ReadHalfClosed, Errored)
                | (WriteHalfClosed, Closed)
                | (WriteHalfClosed, Errored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SocketPhase::Closed | SocketPhase::Errored)
    }

    pub fn is_connected(self) -> bool {
        !matches!(self, SocketPhase::Unconnected)
    }
}

/// 由两个独立的半关闭标志推导阶段。
#[derive(Debug)]
pub(crate) struct SocketLifecycle {
    phase: SocketPhase,
    read_closed: bool,
    write_closed: bool,
}

impl SocketLifecycle {
    pub(crate) fn new(connected: bool) -> Self {
        Self {
            phase: if connected {
                SocketPhase::Connected
            } else {
                SocketPhase::Unconnected
            },
            read_closed: false,
            write_closed: false,
        }
    }

    pub(crate) fn phase(&self) -> SocketPhase {
        self.phase
    }

    pub(crate) fn read_closed(&self) -> bool {
        self.read_closed
    }

    pub(crate) fn write_closed(&self) -> bool {
        self.write_closed
    }

    pub(crate) fn connect(&mut self) -> bool {
        self.advance(SocketPhase::Connected)
    }

    pub(crate) fn close_read(&mut self) -> bool {
        if self.read_closed || self.phase.is_terminal() {
            return false;
        }
        self.read_closed = true;
        self.settle()
    }

    pub(crate) fn close_write(&mut self) -> bool {
        if self.write_closed || self.phase.is_terminal() {
            return false;
        }
        self.write_closed = true;
        if self.phase == SocketPhase::Unconnected {
            self.read_closed = true;
        }
        self.settle()
    }

    pub(crate) fn fail(&mut self) -> bool {
        self.read_closed = true;
        self.write_closed = true;
        self.advance(SocketPhase::Errored)
    }

    fn settle(&mut self) -> bool {
        let target = match (self.read_closed, self.write_closed) {
            (true, true) => SocketPhase::Closed,
            (true, false) => SocketPhase::ReadHalfClosed,
            (false, true) => SocketPhase::WriteHalfClosed,
            (false, false) => return false,
        };
        self.advance(target)
    }

    fn advance(&mut self, target: SocketPhase) -> bool {
        if !self.phase.can_transition_to(target) {
            return false;
        }
        self.phase = target;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_closes_in_either_order_reach_closed() {
        let mut read_first = SocketLifecycle::new(true);
        assert!(read_first.close_read());
        assert_eq!(read_first.phase(), SocketPhase::ReadHalfClosed);
        assert!(read_first.close_write());
        assert_eq!(read_first.phase(), SocketPhase::Closed);

        let mut write_first = SocketLifecycle::new(true);
        assert!(write_first.close_write());
        assert_eq!(write_first.phase(), SocketPhase::WriteHalfClosed);
        assert!(!write_first.close_write(), "second close is a no-op");
        assert!(write_first.close_read());
        assert_eq!(write_first.phase(), SocketPhase::Closed);
    }

    #[test]
    fn ending_an_unconnected_stream_closes_it() {
        let mut lifecycle = SocketLifecycle::new(false);
        assert!(lifecycle.close_write());
        assert_eq!(lifecycle.phase(), SocketPhase::Closed);
        assert!(!lifecycle.connect());
    }

    #[test]
    fn errors_force_both_directions_closed_but_not_after_close() {
        let mut lifecycle = SocketLifecycle::new(true);
        lifecycle.close_read();
        assert!(lifecycle.fail());
        assert_eq!(lifecycle.phase(), SocketPhase::Errored);
        assert!(lifecycle.read_closed() && lifecycle.write_closed());

        let mut closed = SocketLifecycle::new(true);
        closed.close_read();
        closed.close_write();
        assert!(!closed.fail());
        assert_eq!(closed.phase(), SocketPhase::Closed);
    }
}
