//! Destination weight normalization

use crate::ingress::model::WrapperHttpRoute;

const TOTAL_WEIGHT: i32 = 100;

/// Rescale a route's destination weights so they sum to exactly 100.
///
/// A single destination gets everything. Otherwise every destination after
/// the first is scaled against the larger of their own sum and the route's
/// explicit weight total, truncating, and the first destination takes the
/// remainder.
pub fn normalize_weights(route: &mut WrapperHttpRoute) {
    let destinations = &mut route.route.route;
    match destinations.len() {
        0 => return,
        1 => {
            destinations[0].weight = TOTAL_WEIGHT;
            return;
        }
        _ => {}
    }

    let actual: i64 = destinations[1..].iter().map(|d| i64::from(d.weight)).sum();
    let total = actual.max(i64::from(route.weight_total));

    let mut sum = 0;
    for destination in destinations[1..].iter_mut() {
        let scaled = if total > 0 {
            i64::from(destination.weight) * i64::from(TOTAL_WEIGHT) / total
        } else {
            0
        };
        destination.weight = i32::try_from(scaled).unwrap_or(TOTAL_WEIGHT);
        sum += destination.weight;
    }
    destinations[0].weight = TOTAL_WEIGHT - sum;
}
