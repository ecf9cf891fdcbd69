use boxwatch::{is_alarm, PinStateTracker};
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_is_alarm_matches_wiring(level in any::<bool>(), normally_open in any::<bool>()) {
        prop_assert_eq!(is_alarm(level, normally_open), level == normally_open);
    }

    #[test]
    fn test_repeated_level_yields_one_edge(pin in 1u8..=32, level in any::<bool>(), repeats in 1usize..50) {
        let mut tracker = PinStateTracker::new();
        let edges: usize = (0..repeats).map(|_| tracker.observe([(pin, level)]).len()).sum();
        prop_assert_eq!(edges, 1);
    }

    #[test]
    fn test_edges_match_level_changes(levels in prop::collection::vec(any::<bool>(), 1..100)) {
        let mut tracker = PinStateTracker::new();
        let mut edges = 0;
        for level in &levels {
            edges += tracker.observe([(4, *level)]).len();
        }
        let changes = levels.windows(2).filter(|w| w[0] != w[1]).count();
        // The first observation always counts
        prop_assert_eq!(edges, changes + 1);
        prop_assert_eq!(tracker.level(4), levels.last().copied());
    }
}
