// =============================================================================
// Contract & spread selection — deterministic multi-factor scoring
// =============================================================================
//
// Liquidity is a hard wall: a chain older than five minutes is stale, and a
// leg with thin open interest, thin volume, a one-sided quote, or a spread
// over 15% of mid never trades.
//
// Debit verticals buy cheap gamma: the long leg wants delta in [0.10, 0.30],
// mid in [$0.20, $0.60], and 1–3 strikes OTM. Candidates score as
//
//   0.40·gamma + 0.30·(1−theta) + 0.20·delta-proximity + 0.10·(1−vega)
//
// (all normalized), and the paired spread is accepted only when its
// risk:reward lands in [1.5, 2.5]. Credit verticals score the SHORT leg with
// the theta half swapped (collecting decay is the point) and the vega half
// unchanged. Lottos reuse the debit score on a single leg.
//
// Selection failures are values, not errors: every rejection carries the
// reason the caller records against the signal.
// =============================================================================

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use super::types::{CreditSpread, DebitSpread, OptionContract, OptionKind};

/// Chain freshness bound.
const MAX_CHAIN_AGE_MINUTES: i64 = 5;

/// Hard liquidity gates per leg.
const MIN_OPEN_INTEREST: u64 = 100;
const MIN_VOLUME: u64 = 50;
const MAX_SPREAD_PCT: f64 = 0.15;

/// Long-leg premium window for debit structures.
const PREMIUM_MIN: f64 = 0.20;
const PREMIUM_MAX: f64 = 0.60;

/// Delta window and proximity band.
const DELTA_MIN: f64 = 0.10;
const DELTA_MAX: f64 = 0.30;
const DELTA_PROXIMITY_BAND: f64 = 0.10;

/// Strikes-OTM window for the scored leg.
const MIN_STRIKES_OTM: usize = 1;
const MAX_STRIKES_OTM: usize = 3;

/// Acceptable risk:reward for a debit vertical.
const RR_MIN: f64 = 1.5;
const RR_MAX: f64 = 2.5;

/// Greeks normalization ceilings for 0DTE OTM contracts.
const GAMMA_CEILING: f64 = 0.10;
const THETA_CEILING: f64 = 0.30;
const VEGA_CEILING: f64 = 0.15;

/// Why selection produced nothing. These skip the signal, they are not
/// system errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SelectReject {
    #[error("chain is stale ({0} minutes old)")]
    StaleChain(i64),
    #[error("leg illiquid: {0}")]
    Illiquid(String),
    #[error("no candidate legs after filters: {0}")]
    NoCandidates(String),
    #[error("no spread with acceptable risk:reward: {0}")]
    SpreadReject(String),
}

/// Spread width preset per symbol, switched on the day's ORB range.
pub fn spread_width_for(symbol: &str, orb_range_dollars: f64) -> f64 {
    match symbol {
        "SPX" => {
            if orb_range_dollars >= 10.0 {
                10.0
            } else {
                5.0
            }
        }
        "IWM" => 1.0,
        // SPY / QQQ and anything else on a $1 grid.
        _ => {
            if orb_range_dollars >= 2.0 {
                2.0
            } else {
                1.0
            }
        }
    }
}

/// Reject a stale chain before looking at any leg.
pub fn check_chain_age(fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), SelectReject> {
    let age = (now - fetched_at).num_minutes();
    if age > MAX_CHAIN_AGE_MINUTES {
        return Err(SelectReject::StaleChain(age));
    }
    Ok(())
}

/// Per-leg liquidity gates; returns the failure reason.
pub fn leg_liquidity(contract: &OptionContract) -> Result<(), String> {
    if contract.open_interest < MIN_OPEN_INTEREST {
        return Err(format!(
            "open interest {} < {MIN_OPEN_INTEREST}",
            contract.open_interest
        ));
    }
    if contract.volume < MIN_VOLUME {
        return Err(format!("volume {} < {MIN_VOLUME}", contract.volume));
    }
    if contract.bid <= 0.0 || contract.ask <= 0.0 {
        return Err("one-sided or empty quote".into());
    }
    let spread_pct = contract.spread_pct();
    if spread_pct > MAX_SPREAD_PCT {
        return Err(format!(
            "spread {:.1}% of mid > {:.0}%",
            spread_pct * 100.0,
            MAX_SPREAD_PCT * 100.0
        ));
    }
    Ok(())
}

fn norm(value: f64, ceiling: f64) -> f64 {
    (value.abs() / ceiling).min(1.0)
}

/// Long-leg score for debit structures: cheap gamma, low decay, delta near
/// target, low IV sensitivity.
pub fn debit_leg_score(contract: &OptionContract, target_delta: f64) -> f64 {
    let gamma = norm(contract.gamma, GAMMA_CEILING);
    let theta = norm(contract.theta, THETA_CEILING);
    let vega = norm(contract.vega, VEGA_CEILING);
    let delta_prox =
        (1.0 - (contract.delta.abs() - target_delta).abs() / DELTA_PROXIMITY_BAND).max(0.0);
    0.40 * gamma + 0.30 * (1.0 - theta) + 0.20 * delta_prox + 0.10 * (1.0 - vega)
}

/// Short-leg score for credit structures: the theta half swaps (decay is
/// income), the vega half still penalizes IV sensitivity.
pub fn credit_leg_score(contract: &OptionContract, target_delta: f64) -> f64 {
    let gamma = norm(contract.gamma, GAMMA_CEILING);
    let theta = norm(contract.theta, THETA_CEILING);
    let vega = norm(contract.vega, VEGA_CEILING);
    let delta_prox =
        (1.0 - (contract.delta.abs() - target_delta).abs() / DELTA_PROXIMITY_BAND).max(0.0);
    0.40 * gamma + 0.30 * theta + 0.20 * delta_prox + 0.10 * (1.0 - vega)
}

/// How many strikes OTM a contract sits, on the chain's own strike grid.
fn strikes_otm(strike: f64, kind: OptionKind, spot: f64, all_strikes: &[f64]) -> usize {
    match kind {
        OptionKind::Call => all_strikes.iter().filter(|s| **s > spot && **s <= strike).count(),
        OptionKind::Put => all_strikes.iter().filter(|s| **s < spot && **s >= strike).count(),
    }
}

/// Candidate long legs after every hard filter, sorted best-first.
fn candidate_legs<'a>(
    contracts: &'a [OptionContract],
    kind: OptionKind,
    spot: f64,
    target_delta: f64,
    score: fn(&OptionContract, f64) -> f64,
) -> Vec<&'a OptionContract> {
    let mut strikes: Vec<f64> = contracts.iter().map(|c| c.strike).collect();
    strikes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    strikes.dedup();

    let mut out: Vec<&OptionContract> = contracts
        .iter()
        .filter(|c| c.kind == kind)
        .filter(|c| {
            let d = c.delta.abs();
            (DELTA_MIN..=DELTA_MAX).contains(&d)
        })
        .filter(|c| (PREMIUM_MIN..=PREMIUM_MAX).contains(&c.mid()))
        .filter(|c| {
            let n = strikes_otm(c.strike, kind, spot, &strikes);
            (MIN_STRIKES_OTM..=MAX_STRIKES_OTM).contains(&n)
        })
        .filter(|c| leg_liquidity(c).is_ok())
        .collect();

    out.sort_by(|a, b| {
        score(b, target_delta)
            .partial_cmp(&score(a, target_delta))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                (a.delta.abs() - target_delta)
                    .abs()
                    .partial_cmp(&(b.delta.abs() - target_delta).abs())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    out
}

/// Select a debit vertical: best scored long leg paired `spread_width` away,
/// first pair whose risk:reward lands in [1.5, 2.5].
pub fn select_debit_spread(
    contracts: &[OptionContract],
    kind: OptionKind,
    spot: f64,
    target_delta: f64,
    spread_width: f64,
) -> Result<DebitSpread, SelectReject> {
    let candidates = candidate_legs(contracts, kind, spot, target_delta, debit_leg_score);
    if candidates.is_empty() {
        return Err(SelectReject::NoCandidates(format!(
            "no {kind} legs with delta in [{DELTA_MIN}, {DELTA_MAX}], premium in [{PREMIUM_MIN}, {PREMIUM_MAX}], 1-3 strikes OTM"
        )));
    }

    let mut last_rr = None;
    for long_leg in candidates {
        let short_strike = match kind {
            OptionKind::Call => long_leg.strike + spread_width,
            OptionKind::Put => long_leg.strike - spread_width,
        };
        let Some(short_leg) = contracts
            .iter()
            .find(|c| c.kind == kind && (c.strike - short_strike).abs() < 1e-9)
        else {
            continue;
        };
        if let Err(reason) = leg_liquidity(short_leg) {
            debug!(strike = short_leg.strike, %reason, "short leg rejected");
            continue;
        }

        let spread = DebitSpread::build(long_leg.clone(), short_leg.clone());
        if spread.debit_cost <= 0.0 {
            continue;
        }
        let rr = spread.risk_reward();
        if (RR_MIN..=RR_MAX).contains(&rr) {
            debug!(
                long = spread.long_leg.strike,
                short = spread.short_leg.strike,
                debit = spread.debit_cost,
                rr = format!("{rr:.2}"),
                "debit spread selected"
            );
            return Ok(spread);
        }
        last_rr = Some(rr);
    }

    Err(SelectReject::SpreadReject(match last_rr {
        Some(rr) => format!("best risk:reward {rr:.2} outside [{RR_MIN}, {RR_MAX}]"),
        None => "no short leg available at the spread width".into(),
    }))
}

/// Select a credit vertical: the scored leg is the SHORT one; the long wing
/// sits `spread_width` further OTM.
pub fn select_credit_spread(
    contracts: &[OptionContract],
    kind: OptionKind,
    spot: f64,
    target_delta: f64,
    spread_width: f64,
) -> Result<CreditSpread, SelectReject> {
    let candidates = candidate_legs(contracts, kind, spot, target_delta, credit_leg_score);
    if candidates.is_empty() {
        return Err(SelectReject::NoCandidates(
            "no short legs after delta/premium/OTM/liquidity filters".into(),
        ));
    }

    for short_leg in candidates {
        let long_strike = match kind {
            OptionKind::Call => short_leg.strike + spread_width,
            OptionKind::Put => short_leg.strike - spread_width,
        };
        let Some(long_leg) = contracts
            .iter()
            .find(|c| c.kind == kind && (c.strike - long_strike).abs() < 1e-9)
        else {
            continue;
        };
        if leg_liquidity(long_leg).is_err() {
            continue;
        }

        let spread = CreditSpread::build(short_leg.clone(), long_leg.clone());
        if spread.credit_received <= 0.0 || spread.max_loss <= 0.0 {
            continue;
        }
        debug!(
            short = spread.short_leg.strike,
            long = spread.long_leg.strike,
            credit = spread.credit_received,
            "credit spread selected"
        );
        return Ok(spread);
    }

    Err(SelectReject::SpreadReject(
        "no wing available at the spread width".into(),
    ))
}

/// Select a single-leg lotto: best debit-scored contract.
pub fn select_lotto(
    contracts: &[OptionContract],
    kind: OptionKind,
    spot: f64,
    target_delta: f64,
) -> Result<OptionContract, SelectReject> {
    let candidates = candidate_legs(contracts, kind, spot, target_delta, debit_leg_score);
    candidates
        .first()
        .map(|c| (*c).clone())
        .ok_or_else(|| SelectReject::NoCandidates("no lotto candidates".into()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn contract(
        strike: f64,
        mid: f64,
        delta: f64,
        gamma: f64,
        theta: f64,
        vega: f64,
    ) -> OptionContract {
        OptionContract {
            symbol: "SPY".into(),
            strike,
            expiry: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
            kind: OptionKind::Call,
            bid: mid * 0.97,
            ask: mid * 1.03,
            last: mid,
            volume: 600,
            open_interest: 2_000,
            delta,
            gamma,
            theta,
            vega,
            iv: 0.24,
        }
    }

    /// A chain around spot 500 where strike 502 is a clean feasible long
    /// leg and 503/504 carry the short wings.
    fn feasible_chain() -> Vec<OptionContract> {
        vec![
            contract(501.0, 0.80, 0.42, 0.05, -0.20, 0.06), // premium too high
            contract(502.0, 0.40, 0.22, 0.07, -0.12, 0.05), // the pick
            contract(503.0, 0.12, 0.12, 0.05, -0.08, 0.04), // wing (cheap)
            contract(504.0, 0.05, 0.06, 0.03, -0.05, 0.03), // delta too low for a leg
        ]
    }

    #[test]
    fn chain_age_gate() {
        let now = Utc::now();
        assert!(check_chain_age(now - Duration::minutes(4), now).is_ok());
        assert_eq!(
            check_chain_age(now - Duration::minutes(6), now),
            Err(SelectReject::StaleChain(6))
        );
    }

    #[test]
    fn liquidity_gates() {
        let good = contract(502.0, 0.40, 0.22, 0.07, -0.12, 0.05);
        assert!(leg_liquidity(&good).is_ok());

        let mut thin_oi = good.clone();
        thin_oi.open_interest = 50;
        assert!(leg_liquidity(&thin_oi).is_err());

        let mut thin_vol = good.clone();
        thin_vol.volume = 10;
        assert!(leg_liquidity(&thin_vol).is_err());

        let mut no_bid = good.clone();
        no_bid.bid = 0.0;
        assert!(leg_liquidity(&no_bid).is_err());

        let mut wide = good.clone();
        wide.bid = 0.20;
        wide.ask = 0.60; // spread 100% of mid
        assert!(leg_liquidity(&wide).is_err());
    }

    #[test]
    fn spread_width_presets() {
        assert_eq!(spread_width_for("SPY", 1.2), 1.0);
        assert_eq!(spread_width_for("SPY", 2.5), 2.0);
        assert_eq!(spread_width_for("QQQ", 3.0), 2.0);
        assert_eq!(spread_width_for("SPX", 6.0), 5.0);
        assert_eq!(spread_width_for("SPX", 12.0), 10.0);
        assert_eq!(spread_width_for("IWM", 5.0), 1.0);
    }

    #[test]
    fn debit_selection_finds_feasible_pair() {
        // Long 502 (mid 0.40) / short 503 (mid 0.10): debit 0.30 on a $1
        // width, max profit 0.70, rr 2.33 ∈ [1.5, 2.5].
        let mut chain = feasible_chain();
        chain[2] = contract(503.0, 0.10, 0.12, 0.05, -0.08, 0.04);
        let spread = select_debit_spread(&chain, OptionKind::Call, 500.0, 0.20, 1.0)
            .expect("feasible spread");
        assert_eq!(spread.long_leg.strike, 502.0);
        assert_eq!(spread.short_leg.strike, 503.0);
        let rr = spread.risk_reward();
        assert!((RR_MIN..=RR_MAX).contains(&rr), "rr {rr}");
        assert!(leg_liquidity(&spread.long_leg).is_ok());
        assert!(leg_liquidity(&spread.short_leg).is_ok());
    }

    #[test]
    fn debit_selection_rejects_bad_risk_reward() {
        // Rich wing: debit 0.40 − 0.20 = 0.20, profit 0.80, rr 4.0 > 2.5.
        let mut chain = feasible_chain();
        chain[2] = contract(503.0, 0.20, 0.12, 0.05, -0.08, 0.04);
        let result = select_debit_spread(&chain, OptionKind::Call, 500.0, 0.20, 1.0);
        assert!(matches!(result, Err(SelectReject::SpreadReject(_))));
    }

    #[test]
    fn debit_selection_requires_candidates() {
        // Everything outside the delta window.
        let chain = vec![contract(501.0, 0.40, 0.55, 0.05, -0.12, 0.05)];
        let result = select_debit_spread(&chain, OptionKind::Call, 500.0, 0.20, 1.0);
        assert!(matches!(result, Err(SelectReject::NoCandidates(_))));
    }

    #[test]
    fn scoring_prefers_gamma_and_low_decay() {
        let rich_gamma = contract(502.0, 0.40, 0.20, 0.09, -0.08, 0.04);
        let poor_gamma = contract(502.0, 0.40, 0.20, 0.02, -0.25, 0.12);
        assert!(debit_leg_score(&rich_gamma, 0.20) > debit_leg_score(&poor_gamma, 0.20));
    }

    #[test]
    fn credit_scoring_rewards_decay() {
        let fast_decay = contract(502.0, 0.40, 0.20, 0.05, -0.25, 0.05);
        let slow_decay = contract(502.0, 0.40, 0.20, 0.05, -0.05, 0.05);
        assert!(
            credit_leg_score(&fast_decay, 0.20) > credit_leg_score(&slow_decay, 0.20),
            "credit selling wants the decaying contract"
        );
        // And the debit score disagrees, by construction.
        assert!(debit_leg_score(&fast_decay, 0.20) < debit_leg_score(&slow_decay, 0.20));
    }

    #[test]
    fn credit_selection_builds_from_short_leg() {
        let chain = vec![
            contract(502.0, 0.40, 0.22, 0.07, -0.15, 0.05), // short leg
            contract(503.0, 0.15, 0.12, 0.05, -0.08, 0.04), // long wing
        ];
        let spread = select_credit_spread(&chain, OptionKind::Call, 500.0, 0.20, 1.0)
            .expect("credit spread");
        assert_eq!(spread.short_leg.strike, 502.0);
        assert_eq!(spread.long_leg.strike, 503.0);
        assert!((spread.credit_received - 0.25).abs() < 1e-9);
        assert!((spread.max_loss - 0.75).abs() < 1e-9);
    }

    #[test]
    fn lotto_picks_best_scored_leg() {
        let chain = feasible_chain();
        let lotto = select_lotto(&chain, OptionKind::Call, 500.0, 0.20).expect("lotto");
        assert_eq!(lotto.strike, 502.0);
    }

    #[test]
    fn random_chains_with_a_feasible_pair_always_select_in_band() {
        // Property: over randomly generated chains that contain at least one
        // feasible pair, the selected debit spread always lands with
        // risk:reward in [1.5, 2.5] and both legs liquid.
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for round in 0..50 {
            let mut chain = Vec::new();

            // A guaranteed-feasible pair: long mid 0.40, short mid drawn so
            // the debit lands rr in [1.5, 2.5] on a $1 width
            // (debit ∈ [width/3.5, width/2.5] = [0.2857, 0.40]).
            let debit = rng.gen_range(0.29..0.39);
            chain.push(contract(502.0, 0.40, 0.22, 0.07, -0.12, 0.05));
            chain.push(contract(503.0, 0.40 - debit, 0.12, 0.05, -0.08, 0.04));

            // Noise contracts with random attributes, some illiquid.
            for i in 0..6 {
                let strike = 504.0 + i as f64;
                let mut noise = contract(
                    strike,
                    rng.gen_range(0.02..0.90),
                    rng.gen_range(0.01..0.60),
                    rng.gen_range(0.0..0.12),
                    -rng.gen_range(0.0..0.35),
                    rng.gen_range(0.0..0.20),
                );
                if rng.gen_bool(0.3) {
                    noise.open_interest = 10; // illiquid
                }
                chain.push(noise);
            }

            let spread = select_debit_spread(&chain, OptionKind::Call, 500.0, 0.20, 1.0)
                .unwrap_or_else(|e| panic!("round {round}: no spread ({e})"));
            let rr = spread.risk_reward();
            assert!(
                (RR_MIN..=RR_MAX).contains(&rr),
                "round {round}: rr {rr} out of band"
            );
            assert!(leg_liquidity(&spread.long_leg).is_ok());
            assert!(leg_liquidity(&spread.short_leg).is_ok());
        }
    }

    #[test]
    fn put_side_counts_otm_downward() {
        let mut chain: Vec<OptionContract> = Vec::new();
        for (strike, mid, delta) in [(499.0, 0.40, -0.22), (498.0, 0.25, -0.15), (497.0, 0.12, -0.10)] {
            let mut c = contract(strike, mid, delta, 0.06, -0.10, 0.05);
            c.kind = OptionKind::Put;
            chain.push(c);
        }
        // Long 499 put (1 strike OTM), short 498: debit 0.15, width 1.0,
        // profit 0.85 — rr out of band; shrink the wing gap via premium.
        chain[1] = {
            let mut c = contract(498.0, 0.10, -0.14, 0.05, -0.08, 0.04);
            c.kind = OptionKind::Put;
            c
        };
        // debit 0.30, profit 0.70, rr 2.33.
        let spread = select_debit_spread(&chain, OptionKind::Put, 500.0, 0.20, 1.0)
            .expect("put spread");
        assert_eq!(spread.long_leg.strike, 499.0);
        assert_eq!(spread.short_leg.strike, 498.0);
    }
}
