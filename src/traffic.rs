//! Click-through share estimates by search result position.

const POSITION_TRAFFIC_SHARE: [f64; 30] = [
    0.30, 0.13, 0.09, 0.06, 0.04, 0.03, 0.023, 0.019, 0.019, 0.017, // 1-10
    0.013, 0.013, 0.013, 0.013, 0.013, // 11-15
    0.01, 0.01, 0.01, 0.01, 0.01, // 16-20
    0.002, 0.002, 0.002, 0.002, 0.002, 0.002, 0.002, 0.002, 0.002, 0.002, // 21-30
];

const MAX_RANKED_POSITION: f64 = 30.0;

fn table_share(position: usize) -> f64 {
    match position {
        1..=30 => POSITION_TRAFFIC_SHARE[position - 1],
        _ => 0.0,
    }
}

/// Estimated share of clicks landing on `position`, interpolated linearly
/// between neighbouring integer ranks. Positions past 30 get nothing.
pub fn share_for_position(position: f64) -> f64 {
    if !position.is_finite() || position < 0.0 || position > MAX_RANKED_POSITION {
        return 0.0;
    }

    let lower = position.floor();
    let upper = position.ceil();
    let lower_share = table_share(lower as usize);
    if lower == upper {
        return lower_share;
    }

    let upper_share = table_share(upper as usize);
    lower_share + (position - lower) * (upper_share - lower_share)
}

pub fn estimated_traffic(position: f64, search_volume: u64) -> u64 {
    (search_volume as f64 * share_for_position(position)).floor() as u64
}
