// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sliding-window E.T.A. estimator (spec §4.7, C7): a dual linear
//! regression over a 12-sample window, reseated through the most recent
//! observation. Ported from `original_source/fsremap/src/eta.cc`'s
//! `ft_eta::add`/`ff_least_squares`.

use std::collections::VecDeque;

use byte_unit::Byte;

const MIN_SAMPLES: usize = 3;
const DEFAULT_WINDOW: usize = 12;

/// Formats a byte count for progress/log output, e.g. `"4.0 MiB"`.
pub fn format_bytes(count: u64) -> String {
    let adjusted_byte = Byte::from_u64(count).get_appropriate_unit(byte_unit::UnitType::Binary);
    format!("{adjusted_byte:.1}")
}

/// Tracks `(elapsed_seconds, fraction_done)` samples and extrapolates time
/// remaining. `fraction_done` must be non-decreasing and in `[0.0, 1.0]`.
pub struct Eta {
    max_n: usize,
    x: VecDeque<f64>,
    y: VecDeque<f64>,
}

impl Eta {
    pub fn new(max_n: usize) -> Self {
        Eta {
            max_n,
            x: VecDeque::with_capacity(max_n),
            y: VecDeque::with_capacity(max_n),
        }
    }

    /// Adds a sample at `elapsed_seconds` with `fraction_done` and returns
    /// the estimated number of seconds remaining, or `None` if there is not
    /// yet enough data, the trend is flat or decreasing, or the
    /// extrapolated point already lies in the past.
    pub fn add(&mut self, elapsed_seconds: f64, fraction_done: f64) -> Option<f64> {
        if self.max_n == 0 {
            return None;
        }

        if self.x.len() == self.max_n {
            self.x.pop_front();
            self.y.pop_front();
        }
        self.x.push_back(elapsed_seconds);
        self.y.push_back(fraction_done);

        let n = self.x.len();
        if n < MIN_SAMPLES {
            return None;
        }

        let xs: Vec<f64> = self.x.iter().copied().collect();
        let ys: Vec<f64> = self.y.iter().copied().collect();

        let m_all = least_squares_slope(&xs, &ys)?;
        if m_all <= 0.0 {
            return None;
        }

        let last_n = MIN_SAMPLES.min(n);
        let m_last = least_squares_slope(&xs[n - last_n..], &ys[n - last_n..]);
        let slope = match m_last {
            Some(m) if m > 0.0 => 0.5 * (m_all + m),
            _ => m_all,
        };

        let last_y = *ys.last().expect("n >= MIN_SAMPLES > 0");
        let seconds_left = (1.0 - last_y) / slope;
        if seconds_left < 0.0 {
            None
        } else {
            Some(seconds_left)
        }
    }
}

impl Default for Eta {
    fn default() -> Self {
        Eta::new(DEFAULT_WINDOW)
    }
}

/// Ordinary least-squares slope over `(x[i], y[i])`, translated to be
/// numerically stable by subtracting the first sample before summing, as
/// the original does. Returns `None` when the x-values are degenerate
/// (zero variance).
fn least_squares_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len() as f64;
    let x0 = x[0];
    let y0 = y[0];

    let mut sum_x = 0.0;
    let mut sum_x2 = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;

    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let xt = xi - x0;
        let yt = yi - y0;
        sum_x += xt;
        sum_x2 += xt * xt;
        sum_y += yt;
        sum_xy += xt * yt;
    }

    let variance = sum_x2 - sum_x * sum_x / n;
    if variance == 0.0 {
        return None;
    }
    let covariance = sum_xy - sum_x * sum_y / n;
    Some(covariance / variance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_three_samples_is_unknown() {
        let mut eta = Eta::new(DEFAULT_WINDOW);
        assert_eq!(eta.add(0.0, 0.0), None);
        assert_eq!(eta.add(1.0, 0.1), None);
    }

    #[test]
    fn steady_linear_progress_extrapolates_to_completion() {
        let mut eta = Eta::new(DEFAULT_WINDOW);
        eta.add(0.0, 0.0);
        eta.add(1.0, 0.1);
        let result = eta.add(2.0, 0.2).unwrap();
        // at 0.1 fraction/sec, 0.8 remaining -> 8s left
        assert!((result - 8.0).abs() < 1e-9, "got {result}");
    }

    #[test]
    fn flat_progress_is_unknown() {
        let mut eta = Eta::new(DEFAULT_WINDOW);
        eta.add(0.0, 0.5);
        eta.add(1.0, 0.5);
        assert_eq!(eta.add(2.0, 0.5), None);
    }

    #[test]
    fn regressing_progress_is_unknown() {
        let mut eta = Eta::new(DEFAULT_WINDOW);
        eta.add(0.0, 0.5);
        eta.add(1.0, 0.4);
        assert_eq!(eta.add(2.0, 0.3), None);
    }

    #[test]
    fn window_slides_and_caps_at_max_n() {
        let mut eta = Eta::new(3);
        eta.add(0.0, 0.0);
        eta.add(1.0, 0.1);
        eta.add(2.0, 0.2);
        // window is now full; the next sample evicts (0.0, 0.0)
        let result = eta.add(3.0, 0.3).unwrap();
        assert!((result - 7.0).abs() < 1e-9, "got {result}");
    }

    #[test]
    fn zero_window_is_always_unknown() {
        let mut eta = Eta::new(0);
        assert_eq!(eta.add(0.0, 0.0), None);
        assert_eq!(eta.add(1.0, 1.0), None);
    }

    #[test]
    fn format_bytes_picks_a_binary_unit() {
        assert_eq!(format_bytes(0), "0.0 B");
        assert_eq!(format_bytes(1 << 20), "1.0 MiB");
    }
}
