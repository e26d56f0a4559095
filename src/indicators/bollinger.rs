// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band is the SMA; upper/lower sit `num_std` standard deviations away.
// Width = (upper - lower) / middle * 100.
// =============================================================================

/// Bands at the latest close.
#[derive(Debug, Clone, Copy)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bands over the trailing `period` closes, or `None` when degenerate.
pub fn latest(closes: &[f64], period: usize, num_std: f64) -> Option<Bollinger> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(Bollinger {
        upper,
        middle,
        lower,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_bracket_the_mean() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let b = latest(&closes, 20, 2.0).unwrap();
        assert!(b.upper > b.middle);
        assert!(b.lower < b.middle);
        assert!(b.width > 0.0);
    }

    #[test]
    fn none_on_short_input() {
        assert!(latest(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn flat_tape_has_zero_width() {
        let closes = vec![100.0; 20];
        let b = latest(&closes, 20, 2.0).unwrap();
        assert!(b.width.abs() < 1e-10);
    }
}
