// =============================================================================
// MACD (12 / 26 / 9)
// =============================================================================
//
//   macd_line   = EMA12 - EMA26
//   signal_line = EMA9 of the macd line
//   histogram   = macd_line - signal_line
//
// The histogram sign is what the signal gates consume: positive histogram is
// momentum confirmation for longs, negative for shorts.
// =============================================================================

use super::ema;

const FAST: usize = 12;
const SLOW: usize = 26;
const SIGNAL: usize = 9;

/// The three MACD components at the latest close.
#[derive(Debug, Clone, Copy)]
pub struct Macd {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
}

/// Latest MACD reading, or `None` when fewer than `SLOW + SIGNAL` closes.
pub fn latest(closes: &[f64]) -> Option<Macd> {
    if closes.len() < SLOW + SIGNAL {
        return None;
    }

    let fast = ema::series(closes, FAST);
    let slow = ema::series(closes, SLOW);

    // Align the two series on their tails; slow is the shorter one.
    let n = slow.len().min(fast.len());
    if n == 0 {
        return None;
    }
    let macd_series: Vec<f64> = fast[fast.len() - n..]
        .iter()
        .zip(&slow[slow.len() - n..])
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema::series(&macd_series, SIGNAL);
    let signal_line = *signal_series.last()?;
    let macd_line = *macd_series.last()?;

    Some(Macd {
        macd_line,
        signal_line,
        histogram: macd_line - signal_line,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_on_short_input() {
        let closes = vec![100.0; 30];
        assert!(latest(&closes).is_none());
    }

    #[test]
    fn flat_tape_is_zero() {
        let closes = vec![100.0; 60];
        let m = latest(&closes).unwrap();
        assert!(m.macd_line.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn fresh_uptrend_has_positive_histogram() {
        // Flat base, then a sustained push: fast EMA leads, histogram > 0.
        let mut closes = vec![100.0; 40];
        for i in 0..15 {
            closes.push(100.0 + (i + 1) as f64 * 0.5);
        }
        let m = latest(&closes).unwrap();
        assert!(m.macd_line > 0.0, "macd {}", m.macd_line);
        assert!(m.histogram > 0.0, "histogram {}", m.histogram);
    }

    #[test]
    fn fresh_downtrend_has_negative_histogram() {
        let mut closes = vec![100.0; 40];
        for i in 0..15 {
            closes.push(100.0 - (i + 1) as f64 * 0.5);
        }
        let m = latest(&closes).unwrap();
        assert!(m.macd_line < 0.0);
        assert!(m.histogram < 0.0);
    }
}
