use std::io::Write;

use crate::state::{Hop, PhaseResult, StopReason, TraceOutcome};

fn describe(stop: StopReason) -> &'static str {
    match stop {
        StopReason::GlobalStopSet => "reached a link already in the global stop set",
        StopReason::Destination => "destination reached",
        StopReason::HopLimit => "hop limit reached",
        StopReason::LocalStopSet => "reached a link already closed toward this source",
        StopReason::PathExhausted => "walked back to the source",
        StopReason::Cancelled => "cancelled",
    }
}

fn host(hop: &Hop) -> String {
    match (hop.success, hop.hostname.as_ref()) {
        (false, _) => "* * *".to_string(),
        (true, Some(name)) => format!("{} ({})", name, hop.address),
        (true, None) => hop.address.to_string(),
    }
}

fn write_phase<W: Write>(writer: &mut W, title: &str, result: &PhaseResult, by_ttl: bool) -> std::io::Result<()> {
    writeln!(writer, "  {} ({}, {} probes)", title, describe(result.stop), result.probes_sent)?;
    let mut hops: Vec<&Hop> = result.path.iter().chain(result.unanswered.iter()).collect();
    if by_ttl {
        hops.sort_by_key(|h| h.ttl);
    }
    for hop in hops {
        let rtt = if hop.success {
            format!("{:.1}ms", hop.elapsed.as_secs_f64() * 1000.0)
        } else {
            "-".to_string()
        };
        writeln!(writer, "  {:>3}  {:<50} {:>9}", hop.ttl, host(hop), rtt)?;
    }
    Ok(())
}

/// Text report of a DoubleTree run, one block per destination
pub fn generate_report<W: Write>(outcomes: &[TraceOutcome], mut writer: W) -> std::io::Result<()> {
    let Some(first) = outcomes.first() else {
        return writeln!(writer, "doubletree report: no destinations traced");
    };
    writeln!(writer, "doubletree report from {}", first.source)?;
    writeln!(writer, "Started: {}", first.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    let probes: u32 = outcomes.iter().map(TraceOutcome::probes_sent).sum();
    writeln!(writer, "Destinations: {}  Probes: {}", outcomes.len(), probes)?;

    for outcome in outcomes {
        writeln!(writer)?;
        writeln!(
            writer,
            "{} (hop limit {})",
            outcome.destination, outcome.hop_limit
        )?;
        write_phase(&mut writer, "forward", &outcome.forward, true)?;
        if !outcome.backward.path.is_empty() || !outcome.backward.unanswered.is_empty() {
            write_phase(&mut writer, "backward", &outcome.backward, false)?;
        }
    }

    Ok(())
}

/// Generate report to string
pub fn generate_report_string(outcomes: &[TraceOutcome]) -> String {
    let mut buf = Vec::new();
    // Writing to a Vec cannot fail
    let _ = generate_report(outcomes, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
