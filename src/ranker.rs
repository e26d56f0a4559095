// =============================================================================
// Priority ranker & position sizer — score, rank, greedy-pack
// =============================================================================
//
// Scoring: a fixed-weight sum of five normalized factors per signal.
//
//   breakout % beyond the ORB extreme   0.30
//   ORB range %                          0.25
//   volume ratio vs the opening bar      0.20
//   eligibility score (carry-through)    0.15
//   momentum beyond the extreme          0.10
//
// Ranking: strict descending on priority score; ties break on confidence
// descending, then ticker ascending, so the ordering is total and
// deterministic for any input set.
//
// Sizing: greedy packing under a deployment budget. Top `max_concurrent`
// signals share `trading_capital` at a fair share scaled by rank
// multipliers, capped per-position, then normalized back down when the
// capped sum still exceeds the budget. Pure function of its inputs.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::orb::signals::OrbSignal;

// =============================================================================
// Factor normalizations
// =============================================================================

/// Breakout % beyond the ORB extreme: 0.15 below 0.2%, 1.0 at ≥ 5%.
pub fn norm_breakout_pct(pct: f64) -> f64 {
    if pct < 0.2 {
        0.15
    } else if pct >= 5.0 {
        1.0
    } else {
        0.15 + (pct - 0.2) / (5.0 - 0.2) * 0.85
    }
}

/// ORB range %: 0.30 below 0.15%, 1.0 at ≥ 0.50%.
pub fn norm_range_pct(pct: f64) -> f64 {
    if pct < 0.15 {
        0.30
    } else if pct >= 0.50 {
        1.0
    } else {
        0.30 + (pct - 0.15) / (0.50 - 0.15) * 0.70
    }
}

/// Volume ratio vs the opening bar: 0.25 below 1.2×, 1.0 at ≥ 3.0×.
pub fn norm_volume_ratio(ratio: f64) -> f64 {
    if ratio < 1.2 {
        0.25
    } else if ratio >= 3.0 {
        1.0
    } else {
        0.25 + (ratio - 1.2) / (3.0 - 1.2) * 0.75
    }
}

/// Directional momentum beyond the extreme: 0.30 below 0.2%, 1.0 at ≥ 2.0%.
pub fn norm_momentum_pct(pct: f64) -> f64 {
    if pct < 0.2 {
        0.30
    } else if pct >= 2.0 {
        1.0
    } else {
        0.30 + (pct - 0.2) / (2.0 - 0.2) * 0.70
    }
}

const W_BREAKOUT: f64 = 0.30;
const W_RANGE: f64 = 0.25;
const W_VOLUME: f64 = 0.20;
const W_ELIGIBILITY: f64 = 0.15;
const W_MOMENTUM: f64 = 0.10;

/// Priority score in [0, 1] for a signal.
pub fn priority_score(signal: &OrbSignal) -> f64 {
    let breakout = signal.breakout_pct().max(0.0);
    W_BREAKOUT * norm_breakout_pct(breakout)
        + W_RANGE * norm_range_pct(signal.orb.orb_range_pct * 100.0)
        + W_VOLUME * norm_volume_ratio(signal.volume_ratio)
        + W_ELIGIBILITY * signal.eligibility_score.clamp(0.0, 1.0)
        + W_MOMENTUM * norm_momentum_pct(breakout)
}

// =============================================================================
// Ranked signals
// =============================================================================

/// A signal with its computed rank and dollar budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedSignal {
    pub signal: OrbSignal,
    pub priority_score: f64,
    /// 1-based; rank 1 is the strongest signal.
    pub priority_rank: usize,
    /// Dollar budget assigned by the packer; 0 until sizing runs.
    pub capital_allocated: f64,
}

/// Score and rank a batch. The output is a permutation of the input in
/// strict descending priority order with deterministic tie-breaks.
pub fn rank(signals: Vec<OrbSignal>) -> Vec<RankedSignal> {
    let mut ranked: Vec<RankedSignal> = signals
        .into_iter()
        .map(|signal| RankedSignal {
            priority_score: priority_score(&signal),
            priority_rank: 0,
            capital_allocated: 0.0,
            signal,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.priority_score
            .partial_cmp(&a.priority_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.signal
                    .confidence
                    .partial_cmp(&a.signal.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then_with(|| a.signal.ticker.cmp(&b.signal.ticker))
    });

    for (i, entry) in ranked.iter_mut().enumerate() {
        entry.priority_rank = i + 1;
    }
    ranked
}

// =============================================================================
// Greedy packing with normalization
// =============================================================================

/// Sizing inputs; percentages are whole numbers (90 = 90%).
#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub total_account: f64,
    pub trading_capital_pct: f64,
    pub max_position_pct: f64,
    pub max_concurrent: usize,
}

/// Rank multiplier ladder: stronger signals get a larger share of the pool.
fn rank_multiplier(rank: usize) -> f64 {
    match rank {
        1 => 3.0,
        2 => 2.5,
        3 => 2.0,
        4..=5 => 1.71,
        6..=10 => 1.5,
        11..=15 => 1.2,
        _ => 1.0,
    }
}

/// Assign `capital_allocated` to the top `max_concurrent` ranked signals.
///
/// Deterministic and side-effect-free. Post-conditions for any input:
/// the allocations sum to at most `trading_capital`, and no allocation
/// exceeds `max_position_pct` of the account.
pub fn allocate(mut ranked: Vec<RankedSignal>, inputs: SizingInputs) -> Vec<RankedSignal> {
    let trading_capital = inputs.total_account * inputs.trading_capital_pct / 100.0;
    let max_single = inputs.total_account * inputs.max_position_pct / 100.0;

    ranked.truncate(inputs.max_concurrent);
    let n = ranked.len();
    if n == 0 || trading_capital <= 0.0 {
        return ranked;
    }

    let fair_share = trading_capital / n as f64;

    for entry in ranked.iter_mut() {
        let raw = fair_share * rank_multiplier(entry.priority_rank);
        entry.capital_allocated = raw.min(max_single);
    }

    let total: f64 = ranked.iter().map(|r| r.capital_allocated).sum();
    if total > trading_capital {
        let scale = trading_capital / total;
        for entry in ranked.iter_mut() {
            entry.capital_allocated *= scale;
        }
    }

    debug!(
        candidates = n,
        trading_capital,
        allocated = ranked.iter().map(|r| r.capital_allocated).sum::<f64>(),
        "capital allocation complete"
    );
    ranked
}
