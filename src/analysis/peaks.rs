//! # Peak Search
//!
//! Peak finding over a 1-D signal with the conventional filter chain:
//!
//! 1. local maxima (a flat top counts once, at its middle sample)
//! 2. `height`: keep peaks whose value is at least the threshold
//! 3. `distance`: walk peaks from highest to lowest and drop any lower peak closer
//!    than the minimum separation
//! 4. `prominence`: height above the higher of the two lowest points reached before
//!    hitting a taller sample (or the signal edge) on each side
//! 5. `width`: extent at half prominence, interpolated between samples and bounded by
//!    the prominence bases
//!
//! Minima are found by running this over an inverted envelope.

/// Thresholds for [`find_peaks`]. `None` disables a filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeakCriteria {
    pub height: Option<f64>,
    /// Minimum separation in samples
    pub distance: Option<usize>,
    pub prominence: Option<f64>,
    /// Minimum width in samples, measured at half prominence
    pub width: Option<f64>,
}

/// A peak that survived every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    pub index: usize,
    pub height: f64,
    pub prominence: f64,
    pub width: f64,
}

pub fn find_peaks(signal: &[f64], criteria: &PeakCriteria) -> Vec<Peak> {
    let mut peaks = local_maxima(signal);

    if let Some(min_height) = criteria.height {
        peaks.retain(|&p| signal[p] >= min_height);
    }

    if let Some(distance) = criteria.distance {
        if distance > 1 {
            peaks = select_by_distance(signal, &peaks, distance);
        }
    }

    let mut found = Vec::with_capacity(peaks.len());
    for index in peaks {
        let (prominence, left_base, right_base) = prominence(signal, index);
        if criteria.prominence.is_some_and(|min| prominence < min) {
            continue;
        }
        let width = width_at_half_prominence(signal, index, prominence, left_base, right_base);
        if criteria.width.is_some_and(|min| width < min) {
            continue;
        }
        found.push(Peak {
            index,
            height: signal[index],
            prominence,
            width,
        });
    }
    found
}

/// Indices of strict local maxima; plateaus resolve to their middle (rounded down).
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

fn select_by_distance(x: &[f64], peaks: &[usize], distance: usize) -> Vec<usize> {
    let mut keep = vec![true; peaks.len()];
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| x[peaks[b]].total_cmp(&x[peaks[a]]));

    for &j in &order {
        if !keep[j] {
            continue;
        }
        let mut k = j;
        while k > 0 && peaks[j] - peaks[k - 1] < distance {
            keep[k - 1] = false;
            k -= 1;
        }
        let mut k = j + 1;
        while k < peaks.len() && peaks[k] - peaks[j] < distance {
            keep[k] = false;
            k += 1;
        }
    }

    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, keep)| keep.then_some(p))
        .collect()
}

/// Prominence of the peak at `index` plus its left and right bases.
fn prominence(x: &[f64], index: usize) -> (f64, usize, usize) {
    let peak = x[index];

    let mut left_min = peak;
    let mut left_base = index;
    let mut i = index;
    loop {
        if x[i] > peak {
            break;
        }
        if x[i] < left_min {
            left_min = x[i];
            left_base = i;
        }
        if i == 0 {
            break;
        }
        i -= 1;
    }

    let mut right_min = peak;
    let mut right_base = index;
    for (j, &value) in x.iter().enumerate().skip(index) {
        if value > peak {
            break;
        }
        if value < right_min {
            right_min = value;
            right_base = j;
        }
    }

    (peak - left_min.max(right_min), left_base, right_base)
}

fn width_at_half_prominence(
    x: &[f64],
    index: usize,
    prominence: f64,
    left_base: usize,
    right_base: usize,
) -> f64 {
    let height = x[index] - prominence * 0.5;

    let mut i = index;
    while left_base < i && height < x[i] {
        i -= 1;
    }
    let mut left = i as f64;
    if x[i] < height {
        left += (height - x[i]) / (x[i + 1] - x[i]);
    }

    let mut i = index;
    while i < right_base && height < x[i] {
        i += 1;
    }
    let mut right = i as f64;
    if x[i] < height {
        right -= (height - x[i]) / (x[i - 1] - x[i]);
    }

    right - left
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_local_maxima_and_plateaus() {
        let x = [0.0, 1.0, 0.0, 2.0, 2.0, 2.0, 0.0, 3.0, 3.0, 0.0, 1.0];
        assert_eq!(local_maxima(&x), vec![1, 4, 7]);
        // Edges never count
        assert!(local_maxima(&[5.0, 1.0, 5.0]).is_empty());
        assert!(local_maxima(&[1.0, 2.0]).is_empty());
    }

    #[test]
    fn test_height_filter() {
        let x = [0.0, 0.1, 0.0, 0.5, 0.0];
        let peaks = find_peaks(&x, &PeakCriteria { height: Some(0.2), ..Default::default() });
        assert_eq!(peaks.iter().map(|p| p.index).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_distance_keeps_highest() {
        let x = [0.0, 0.5, 0.0, 0.9, 0.0, 0.4, 0.0, 0.0, 0.0, 0.7, 0.0];
        let peaks = find_peaks(&x, &PeakCriteria { distance: Some(3), ..Default::default() });
        assert_eq!(peaks.iter().map(|p| p.index).collect::<Vec<_>>(), vec![3, 9]);
    }

    #[test]
    fn test_prominence_uses_higher_base() {
        // Peak at 3 sits on a slope: left valley 0.2, right valley 0.0
        let x = [0.2, 0.5, 0.2, 1.0, 0.0, 2.0, 0.0];
        let (prom, left_base, right_base) = prominence(&x, 3);
        assert_abs_diff_eq!(prom, 0.8, epsilon = 1e-12);
        assert_eq!((left_base, right_base), (2, 4));

        let peaks = find_peaks(&x, &PeakCriteria { prominence: Some(0.5), ..Default::default() });
        assert_eq!(peaks.iter().map(|p| p.index).collect::<Vec<_>>(), vec![3, 5]);
    }

    #[test]
    fn test_width_of_single_sample_peak() {
        let x = [0.0, 1.0, 0.0, 1.0, 0.0];
        let peaks = find_peaks(&x, &PeakCriteria { width: Some(1.0), ..Default::default() });
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].width, 1.0);
        assert_eq!(peaks[0].prominence, 1.0);
    }

    #[test]
    fn test_width_of_triangle() {
        let x = [0.0, 0.25, 0.5, 0.75, 1.0, 0.75, 0.5, 0.25, 0.0];
        let peaks = find_peaks(&x, &PeakCriteria::default());
        assert_eq!(peaks.len(), 1);
        assert_abs_diff_eq!(peaks[0].width, 4.0, epsilon = 1e-12);
        assert!(find_peaks(&x, &PeakCriteria { width: Some(4.5), ..Default::default() }).is_empty());
    }
}
