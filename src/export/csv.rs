use anyhow::Result;
use std::io::Write;

use crate::state::{Hop, TraceOutcome};

/// Export every hop of every outcome, one row per hop
pub fn export_csv<W: Write>(outcomes: &[TraceOutcome], mut writer: W) -> Result<()> {
    writeln!(writer, "destination,phase,ttl,ip,hostname,success,rtt_ms,stop")?;

    for outcome in outcomes {
        for (phase, result) in [("forward", &outcome.forward), ("backward", &outcome.backward)] {
            let stop = serde_json::to_value(result.stop)?;
            let stop = stop.as_str().unwrap_or_default().to_string();
            let mut hops: Vec<&Hop> = result.path.iter().chain(result.unanswered.iter()).collect();
            if phase == "forward" {
                hops.sort_by_key(|h| h.ttl);
            }
            for hop in hops {
                write_row(&mut writer, outcome, phase, hop, &stop)?;
            }
        }
    }

    Ok(())
}

fn write_row<W: Write>(writer: &mut W, outcome: &TraceOutcome, phase: &str, hop: &Hop, stop: &str) -> Result<()> {
    let (ip, rtt) = if hop.success {
        (
            hop.address.to_string(),
            format!("{:.2}", hop.elapsed.as_secs_f64() * 1000.0),
        )
    } else {
        ("*".to_string(), String::new())
    };
    writeln!(
        writer,
        "{},{},{},{},{},{},{},{}",
        outcome.destination,
        phase,
        hop.ttl,
        ip,
        escape_csv(hop.hostname.as_deref().unwrap_or_default()),
        hop.success,
        rtt,
        stop
    )?;
    Ok(())
}

/// Escape a string for CSV (quote if contains comma, quote, or newline)
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PhaseResult, StopReason};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("simple"), "simple");
        assert_eq!(escape_csv("with,comma"), "\"with,comma\"");
        assert_eq!(escape_csv("with\"quote"), "\"with\"\"quote\"");
    }

    #[test]
    fn test_rows_in_ttl_order() {
        let dest = Ipv4Addr::new(8, 8, 8, 8);
        let mut forward = PhaseResult::new(StopReason::Destination);
        forward.path.push(Hop::reply(Ipv4Addr::new(10, 0, 0, 1), 1, Duration::from_millis(1)));
        forward.path.push(Hop::reply(dest, 3, Duration::from_millis(9)));
        forward.unanswered.push(Hop::unanswered(2));
        let mut backward = PhaseResult::new(StopReason::PathExhausted);
        backward.path.push(Hop::reply(Ipv4Addr::new(10, 0, 0, 1), 1, Duration::from_millis(1)));
        let outcome = TraceOutcome {
            source: Ipv4Addr::new(192, 168, 1, 10),
            destination: dest,
            hop_limit: 8,
            started_at: Utc::now(),
            forward,
            backward,
        };

        let mut buf = Vec::new();
        export_csv(&[outcome], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1], "8.8.8.8,forward,1,10.0.0.1,,true,1.00,destination");
        assert_eq!(lines[2], "8.8.8.8,forward,2,*,,false,,destination");
        assert_eq!(lines[3], "8.8.8.8,forward,3,8.8.8.8,,true,9.00,destination");
        assert_eq!(lines[4], "8.8.8.8,backward,1,10.0.0.1,,true,1.00,path_exhausted");
    }
}
