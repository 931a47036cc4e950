use crate::models::strike_selector::{StrangleSelection, StrikeSelection};
use crate::state::*;
use chrono::NaiveDate;
use smallvec::{smallvec, SmallVec};
use std::collections::HashSet;

/// Which intents may run without a human in the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutomationFlags {
    pub auto_trade: bool,
    pub auto_move: bool,
    pub auto_exit: bool,
}

/// A strangle ready to open if every entry gate passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryProposal {
    pub expiry: NaiveDate,
    pub selection: StrangleSelection,
    pub quantity: u32,
}

/// A decayed leg paired with the strike it would roll to.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveCandidate {
    pub leg: Leg,
    pub replacement: StrikeSelection,
    pub decay: f64,
}

/// Everything one decision cycle looks at. Borrowed, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub signal: SignalState,
    pub window: WindowState,
    pub flags: AutomationFlags,
    pub manual_entry: bool,
    pub capital_available: bool,
    pub entry: Option<&'a EntryProposal>,
    pub moves: &'a [MoveCandidate],
    pub exits: &'a [ExpiryGroup],
    /// Groups at or past the exit-DTE horizon; advisory only.
    pub dte_exits: &'a [ExpiryGroup],
}

/// Combine signal, window, and position evaluations into trade intents.
///
/// Three phases per cycle:
///   1. Exit: groups at their profit target, then DTE advisories
///   2. Move: decayed legs whose expiry is not already exiting
///   3. Enter: confirmed signal inside a window with quota and capital
///
/// Pure function: identical inputs always yield identical intents.
pub fn decide(inputs: &DecisionInputs<'_>) -> SmallVec<[TradeIntent; 8]> {
    let mut intents: SmallVec<[TradeIntent; 8]> = SmallVec::new();
    let mut exiting: HashSet<NaiveDate> = HashSet::new();

    // ── 1. Exits ──
    if inputs.window.inside_exit_window {
        for group in inputs.exits {
            if exiting.insert(group.expiry) {
                intents.push(exit_intent(
                    group,
                    format!(
                        "profit {:.2} of max {:.2} ({:.1}%) reached target {:.0}%",
                        group.total_profit(),
                        group.max_profit,
                        group.profit_fraction() * 100.0,
                        group.target_profit_pct * 100.0
                    ),
                    !inputs.flags.auto_exit,
                ));
            }
        }

        for group in inputs.dte_exits {
            if exiting.insert(group.expiry) {
                intents.push(exit_intent(
                    group,
                    format!("expiry {} inside exit horizon", group.expiry),
                    true,
                ));
            }
        }
    }

    // ── 2. Moves ──
    if inputs.window.inside_exit_window {
        for candidate in inputs.moves {
            if exiting.contains(&candidate.leg.expiry) {
                continue;
            }
            intents.push(move_intent(candidate, !inputs.flags.auto_move));
        }
    }

    // ── 3. Entry ──
    if let Some(entry) = inputs.entry {
        let go = inputs.signal.status == SignalStatus::Ready
            && inputs.window.entry_permitted()
            && inputs.capital_available
            && (inputs.flags.auto_trade || inputs.manual_entry);
        if go {
            intents.push(enter_intent(entry, &inputs.signal, inputs.manual_entry));
        }
    }

    intents
}

fn exit_intent(group: &ExpiryGroup, rationale: String, requires_confirmation: bool) -> TradeIntent {
    TradeIntent {
        kind: IntentKind::Exit,
        expiry: group.expiry,
        legs: group
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Open)
            .map(|l| IntentLeg {
                leg_id: Some(l.id),
                expiry: l.expiry,
                strike: l.strike,
                option_type: l.option_type,
                side: Side::Buy,
                quantity: l.quantity,
                reference_premium: l.current_premium,
                reference_delta: l.current_delta,
            })
            .collect(),
        rationale,
        requires_confirmation,
    }
}

fn move_intent(c: &MoveCandidate, requires_confirmation: bool) -> TradeIntent {
    let leg = &c.leg;
    TradeIntent {
        kind: IntentKind::Move,
        expiry: leg.expiry,
        legs: smallvec![
            IntentLeg {
                leg_id: Some(leg.id),
                expiry: leg.expiry,
                strike: leg.strike,
                option_type: leg.option_type,
                side: Side::Buy,
                quantity: leg.quantity,
                reference_premium: leg.current_premium,
                reference_delta: leg.current_delta,
            },
            IntentLeg {
                leg_id: None,
                expiry: leg.expiry,
                strike: c.replacement.strike,
                option_type: leg.option_type,
                side: Side::Sell,
                quantity: leg.quantity,
                reference_premium: c.replacement.premium,
                reference_delta: c.replacement.delta,
            },
        ],
        rationale: format!(
            "{} {} decayed {:.1}% (delta {:.4} from {:.4}); roll to {} at delta {:.4}",
            leg.option_type,
            leg.strike,
            c.decay * 100.0,
            leg.current_delta,
            leg.entry_delta,
            c.replacement.strike,
            c.replacement.delta
        ),
        requires_confirmation,
    }
}

fn enter_intent(p: &EntryProposal, signal: &SignalState, manual: bool) -> TradeIntent {
    let sel = &p.selection;
    let leg = |s: &StrikeSelection, option_type: OptionType| IntentLeg {
        leg_id: None,
        expiry: p.expiry,
        strike: s.strike,
        option_type,
        side: Side::Sell,
        quantity: p.quantity,
        reference_premium: s.premium,
        reference_delta: s.delta,
    };

    let since = signal
        .confirming_since
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".into());

    TradeIntent {
        kind: IntentKind::Enter,
        expiry: p.expiry,
        legs: smallvec![leg(&sel.call, OptionType::Call), leg(&sel.put, OptionType::Put)],
        rationale: format!(
            "{} entry: straddle above VWAP since {since}; sell {} CE ({:.4}) / {} PE ({:.4}) on {:.2}, credit {:.2}",
            if manual { "manual" } else { "auto" },
            sel.call.strike,
            sel.call.delta,
            sel.put.strike,
            sel.put.delta,
            sel.underlying,
            sel.total_premium
        ),
        requires_confirmation: false,
    }
}
