//! Property-based tests for ledger identity and dedup invariants.
//!
//! For any sequence of `record` calls:
//! - an identity appears in at most one terminal file, at most once
//! - a terminal identity never remains in the errored file
//! - the errored file holds at most one row per identity
//! - the first terminal outcome recorded for an identity is the one kept
//! - load_problematic returns only accepted, non-terminal keys in file order

use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

use redeemer_core::config::LedgerConfig;
use redeemer_core::ledger::Ledger;
use redeemer_core::model::{KeyFormat, KeyId, KeyRecord, RedemptionOutcome};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

const GAMEKEYS: [&str; 2] = ["month-01", "order-77"];
const TITLES: [&str; 4] = ["Game A", "game a", "Second Title", "Title, With \"Quotes\""];

fn arb_outcome() -> impl Strategy<Value = RedemptionOutcome> {
    prop_oneof![
        Just(RedemptionOutcome::Redeemed),
        Just(RedemptionOutcome::AlreadyOwned),
        Just(RedemptionOutcome::Errored),
        Just(RedemptionOutcome::Errored),
        Just(RedemptionOutcome::Expired),
        Just(RedemptionOutcome::Friend),
    ]
}

fn arb_key_value() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("EXPIRED".to_string()),
        "[A-Z0-9]{5}-[A-Z0-9]{5}-[A-Z0-9]{5}",
    ]
}

#[derive(Debug, Clone)]
struct Op {
    gamekey: usize,
    title: usize,
    value: String,
    outcome: RedemptionOutcome,
}

fn arb_op() -> impl Strategy<Value = Op> {
    (0..GAMEKEYS.len(), 0..TITLES.len(), arb_key_value(), arb_outcome()).prop_map(
        |(gamekey, title, value, outcome)| Op {
            gamekey,
            title,
            value,
            outcome,
        },
    )
}

fn key_for(op: &Op) -> KeyRecord {
    KeyRecord::new(GAMEKEYS[op.gamekey], TITLES[op.title]).with_key(op.value.clone())
}

// ────────────────────────────────────────────────────────────────────
// Properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn identity_lives_in_one_terminal_file(ops in prop::collection::vec(arb_op(), 1..25)) {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::open(tmp.path(), &LedgerConfig::default()).unwrap();

        let mut first_terminal: HashMap<KeyId, RedemptionOutcome> = HashMap::new();
        for op in &ops {
            let key = key_for(op);
            ledger.record(&key, op.outcome, "prop").unwrap();
            if op.outcome.is_terminal() {
                first_terminal.entry(key.id()).or_insert(op.outcome);
            }
        }

        let mut seen_terminal: HashSet<KeyId> = HashSet::new();
        for outcome in RedemptionOutcome::TERMINAL {
            for row in ledger.rows(outcome).unwrap() {
                prop_assert!(seen_terminal.insert(row.id()), "{} in two terminal rows", row.id());
                prop_assert_eq!(first_terminal.get(&row.id()), Some(&outcome));
            }
        }
        prop_assert_eq!(seen_terminal.len(), first_terminal.len());

        let mut seen_errored: HashSet<KeyId> = HashSet::new();
        for row in ledger.rows(RedemptionOutcome::Errored).unwrap() {
            prop_assert!(!seen_terminal.contains(&row.id()), "{} terminal and errored", row.id());
            prop_assert!(seen_errored.insert(row.id()), "{} errored twice", row.id());
        }
    }

    #[test]
    fn problematic_queue_is_filtered_and_ordered(ops in prop::collection::vec(arb_op(), 1..25)) {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::open(tmp.path(), &LedgerConfig::default()).unwrap();
        for op in &ops {
            ledger.record(&key_for(op), op.outcome, "prop").unwrap();
        }

        let snapshot = ledger.snapshot().unwrap();
        let errored_order: Vec<KeyId> = ledger
            .rows(RedemptionOutcome::Errored)
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();

        let queue = ledger.load_problematic(KeyFormat::Platform).unwrap();
        let mut last_pos = None;
        let mut ids = HashSet::new();
        for key in &queue {
            let value = key.revealed().unwrap_or_default();
            prop_assert!(KeyFormat::Platform.accepts(value));
            prop_assert!(!snapshot.is_terminal(&key.id()));
            prop_assert!(ids.insert(key.id()));
            let pos = errored_order.iter().position(|id| id == &key.id());
            prop_assert!(pos.is_some());
            prop_assert!(last_pos < pos, "queue out of file order");
            last_pos = pos;
        }

        // Running the filter twice is stable.
        prop_assert_eq!(queue, ledger.load_problematic(KeyFormat::Platform).unwrap());
    }

    #[test]
    fn cleanup_is_idempotent(ops in prop::collection::vec(arb_op(), 1..25)) {
        let tmp = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::open(tmp.path(), &LedgerConfig::default()).unwrap();
        for op in &ops {
            ledger.record(&key_for(op), op.outcome, "prop").unwrap();
        }
        let first = ledger.cleanup_errored(KeyFormat::Lenient).unwrap();
        let second = ledger.cleanup_errored(KeyFormat::Lenient).unwrap();
        prop_assert_eq!(second.before, first.after);
        prop_assert_eq!(second.after, first.after);
        prop_assert_eq!(second.removed_duplicates, 0);
        prop_assert_eq!(second.removed_superseded, 0);
    }
}
