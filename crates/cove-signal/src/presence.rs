//! Who is in a room, derived from recent join/leave history.

use std::collections::{BTreeSet, HashMap};

use crate::signal::{Signal, SignalKind};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    /// Latest join is newer than latest leave.
    pub active: BTreeSet<String>,
    /// Latest leave is at least as new as latest join.
    pub departed: BTreeSet<String>,
}

#[derive(Default, Clone, Copy)]
struct Seen {
    join: Option<u64>,
    leave: Option<u64>,
}

pub fn snapshot(signals: &[Signal], exclude: &str) -> PresenceSnapshot {
    let mut seen: HashMap<&str, Seen> = HashMap::new();
    for signal in signals {
        if signal.sender == exclude {
            continue;
        }
        let slot = match signal.kind() {
            SignalKind::Join => &mut seen.entry(signal.sender.as_str()).or_default().join,
            SignalKind::Leave => &mut seen.entry(signal.sender.as_str()).or_default().leave,
            _ => continue,
        };
        *slot = Some(slot.map_or(signal.timestamp, |prev| prev.max(signal.timestamp)));
    }

    let mut out = PresenceSnapshot::default();
    for (sender, seen) in seen {
        match (seen.join, seen.leave) {
            (Some(join), Some(leave)) if join > leave => out.active.insert(sender.to_string()),
            (Some(_), None) => out.active.insert(sender.to_string()),
            (_, Some(_)) => out.departed.insert(sender.to_string()),
            (None, None) => false,
        };
    }
    out
}

pub fn active_participants(signals: &[Signal], exclude: &str) -> BTreeSet<String> {
    snapshot(signals, exclude).active
}

pub fn departed_participants(signals: &[Signal], exclude: &str) -> BTreeSet<String> {
    snapshot(signals, exclude).departed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{IceCandidate, JoinMarker};

    fn join(sender: &str, ts: u64) -> Signal {
        Signal::join(sender, JoinMarker::fresh()).at(ts)
    }

    #[test_timeout::timeout]
    fn rejoin_after_leave_is_active() {
        let signals = vec![
            join("bob", 10),
            Signal::leave("bob").at(20),
            join("bob", 30),
            join("amy", 12),
            Signal::leave("amy").at(25),
            Signal::candidate("carl", "bob", IceCandidate::new("c")).at(26),
        ];
        let snap = snapshot(&signals, "me");
        assert_eq!(snap.active, BTreeSet::from(["bob".to_string()]));
        assert_eq!(snap.departed, BTreeSet::from(["amy".to_string()]));
    }

    #[test_timeout::timeout]
    fn own_signals_and_order_do_not_matter() {
        let signals = vec![Signal::leave("amy").at(40), join("me", 50), join("amy", 30)];
        assert!(active_participants(&signals, "me").is_empty());
        assert_eq!(
            departed_participants(&signals, "me"),
            BTreeSet::from(["amy".to_string()])
        );
    }

    #[test_timeout::timeout]
    fn targeted_presence_reply_counts_as_join() {
        let reply = Signal::join("amy", JoinMarker::fresh()).to("bob").at(5);
        assert!(active_participants(&[reply], "bob").contains("amy"));
    }
}
