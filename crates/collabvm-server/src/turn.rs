//! Timer-bounded rotation of input control for one VM.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::session::ConnectionId;

/// Request to (re)arm the turn timer. Every state change bumps the epoch,
/// which invalidates timers armed for earlier states; the timer task checks
/// the epoch when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmTimer {
    pub epoch: u64,
    pub duration: Duration,
}

pub struct TurnController {
    queue: VecDeque<ConnectionId>,
    current: Option<ConnectionId>,
    deadline: Option<Instant>,
    paused_remaining: Option<Duration>,
    turn_time: Duration,
    paused: bool,
    epoch: u64,
}

impl TurnController {
    pub fn new(turn_time: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            deadline: None,
            paused_remaining: None,
            turn_time,
            paused: false,
            epoch: 0,
        }
    }

    pub fn set_turn_time(&mut self, turn_time: Duration) {
        self.turn_time = turn_time;
    }

    pub fn holder(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn queue(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.queue.iter().copied()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn millis_remaining(&self) -> u64 {
        if let Some(remaining) = self.paused_remaining {
            return remaining.as_millis() as u64;
        }
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            None => 0,
        }
    }

    /// Enqueue a turn request. The first requester becomes holder at once;
    /// repeat requests from the holder or an already-queued connection are
    /// ignored.
    pub fn request_turn(&mut self, id: ConnectionId) -> Option<ArmTimer> {
        if self.current == Some(id) || self.queue.contains(&id) {
            return None;
        }
        if self.current.is_none() {
            self.current = Some(id);
            return self.arm();
        }
        self.queue.push_back(id);
        None
    }

    /// End the current turn. With `by` set, only the holder may end it;
    /// `None` is the timer-expiry path.
    pub fn end_turn(&mut self, by: Option<ConnectionId>) -> Option<ArmTimer> {
        if let Some(id) = by {
            if self.current != Some(id) {
                return None;
            }
        }
        if self.current.is_none() {
            return None;
        }
        self.advance()
    }

    /// Drop a disconnecting connection from both the holder slot and the
    /// queue. Returns (state changed, timer request).
    pub fn remove(&mut self, id: ConnectionId) -> (bool, Option<ArmTimer>) {
        if self.current == Some(id) {
            let cmd = self.advance();
            return (true, cmd);
        }
        let before = self.queue.len();
        self.queue.retain(|queued| *queued != id);
        (self.queue.len() != before, None)
    }

    pub fn pause(&mut self) -> bool {
        if self.paused {
            return false;
        }
        self.paused = true;
        self.paused_remaining = self
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()));
        self.deadline = None;
        // Invalidates the armed timer.
        self.epoch += 1;
        true
    }

    pub fn resume(&mut self) -> Option<ArmTimer> {
        if !self.paused {
            return None;
        }
        self.paused = false;
        let remaining = self.paused_remaining.take().unwrap_or(self.turn_time);
        if self.current.is_none() {
            return None;
        }
        self.epoch += 1;
        self.deadline = Some(Instant::now() + remaining);
        Some(ArmTimer {
            epoch: self.epoch,
            duration: remaining,
        })
    }

    /// True when a timer armed at `epoch` is still the live one.
    pub fn is_current_epoch(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    fn advance(&mut self) -> Option<ArmTimer> {
        self.current = self.queue.pop_front();
        self.epoch += 1;
        if self.current.is_none() {
            self.deadline = None;
            self.paused_remaining = None;
            return None;
        }
        if self.paused {
            self.deadline = None;
            self.paused_remaining = Some(self.turn_time);
            return None;
        }
        self.arm()
    }

    fn arm(&mut self) -> Option<ArmTimer> {
        self.epoch += 1;
        if self.paused {
            self.paused_remaining = Some(self.turn_time);
            return None;
        }
        self.deadline = Some(Instant::now() + self.turn_time);
        Some(ArmTimer {
            epoch: self.epoch,
            duration: self.turn_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> TurnController {
        TurnController::new(Duration::from_secs(10))
    }

    #[test]
    fn first_requester_becomes_holder() {
        let mut turn = controller();
        let cmd = turn.request_turn(1);
        assert_eq!(turn.holder(), Some(1));
        assert_eq!(cmd.unwrap().duration, Duration::from_secs(10));
        assert!(turn.millis_remaining() > 9_000);
    }

    #[test]
    fn fifo_handoff_order() {
        let mut turn = controller();
        turn.request_turn(1);
        turn.request_turn(2);
        turn.request_turn(3);
        // Duplicate requests are ignored.
        turn.request_turn(2);
        assert_eq!(turn.queue().collect::<Vec<_>>(), vec![2, 3]);

        assert!(turn.end_turn(Some(1)).is_some());
        assert_eq!(turn.holder(), Some(2));
        assert!(turn.end_turn(Some(2)).is_some());
        assert_eq!(turn.holder(), Some(3));
        assert!(turn.end_turn(Some(3)).is_none());
        assert_eq!(turn.holder(), None);
    }

    #[test]
    fn only_the_holder_may_end_a_turn() {
        let mut turn = controller();
        turn.request_turn(1);
        turn.request_turn(2);
        assert!(turn.end_turn(Some(2)).is_none());
        assert_eq!(turn.holder(), Some(1));
    }

    #[test]
    fn expiry_advances_like_end_turn() {
        let mut turn = controller();
        turn.request_turn(1);
        turn.request_turn(2);
        turn.end_turn(None);
        assert_eq!(turn.holder(), Some(2));
    }

    #[test]
    fn disconnect_clears_holder_and_queue() {
        let mut turn = controller();
        turn.request_turn(1);
        turn.request_turn(2);
        turn.request_turn(3);

        let (changed, cmd) = turn.remove(2);
        assert!(changed);
        assert!(cmd.is_none());
        assert_eq!(turn.queue().collect::<Vec<_>>(), vec![3]);

        let (changed, cmd) = turn.remove(1);
        assert!(changed);
        assert!(cmd.is_some());
        assert_eq!(turn.holder(), Some(3));
    }

    #[test]
    fn stale_epochs_are_rejected() {
        let mut turn = controller();
        let cmd = turn.request_turn(1).unwrap();
        assert!(turn.is_current_epoch(cmd.epoch));
        turn.end_turn(Some(1));
        assert!(!turn.is_current_epoch(cmd.epoch));
    }

    #[test]
    fn pause_freezes_the_remaining_interval() {
        let mut turn = controller();
        turn.request_turn(1);
        assert!(turn.pause());
        assert!(turn.is_paused());
        let frozen = turn.millis_remaining();
        assert!(frozen > 0);

        let cmd = turn.resume().unwrap();
        assert!(!turn.is_paused());
        assert!(cmd.duration <= Duration::from_secs(10));
    }

    #[test]
    fn paused_controller_hands_off_without_arming() {
        let mut turn = controller();
        turn.request_turn(1);
        turn.request_turn(2);
        turn.pause();
        let cmd = turn.end_turn(Some(1));
        assert_eq!(turn.holder(), Some(2));
        assert!(cmd.is_none());
        // Resuming arms the timer for the new holder.
        assert!(turn.resume().is_some());
    }
}
