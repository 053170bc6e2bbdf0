//! Connection quality: round-trip time from transport statistics.

use crate::transport::{CandidatePairState, PeerConnection, StatsReport};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum RoundTrip {
    #[default]
    Unknown,
    Measured(Duration),
}

impl fmt::Display for RoundTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundTrip::Unknown => f.write_str("--"),
            RoundTrip::Measured(rtt) => write!(f, "{:.0}ms", rtt.as_secs_f64() * 1000.0),
        }
    }
}

/// RTT of the succeeded candidate pair, if any report carries one.
pub fn round_trip_from(reports: &[StatsReport]) -> Option<Duration> {
    reports.iter().find_map(|report| match report {
        StatsReport::CandidatePair {
            state: CandidatePairState::Succeeded,
            current_round_trip_time: Some(seconds),
        } if seconds.is_finite() && *seconds > 0.0 => Some(Duration::from_secs_f64(*seconds)),
        _ => None,
    })
}

/// Poll the transport once. Keeps `previous` when nothing new is available.
pub async fn poll_round_trip(peer: &dyn PeerConnection, previous: RoundTrip) -> RoundTrip {
    match peer.stats().await {
        Ok(reports) => round_trip_from(&reports).map_or(previous, RoundTrip::Measured),
        Err(e) => {
            tracing::debug!(error = %e, "Stats query failed");
            previous
        }
    }
}
