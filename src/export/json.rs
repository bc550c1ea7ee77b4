use anyhow::Result;
use std::io::Write;

use crate::state::TraceOutcome;

/// Export outcomes as a pretty-printed JSON array
pub fn export_json<W: Write>(outcomes: &[TraceOutcome], writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, outcomes)?;
    Ok(())
}
