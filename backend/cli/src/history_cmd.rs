//! `callforge history`: recent calls straight from the JSONL store.

use std::path::Path;

use anyhow::Result;

use callforge_calls::read_history;
use callforge_core::CallRecord;

use crate::terminal_output::{Column, note_info, paint_state, render_table};

pub fn columns() -> Vec<Column> {
    vec![
        Column::left("Started"),
        Column::left("Call"),
        Column::left("Dir"),
        Column::left("To/From"),
        Column::left("State"),
        Column::right("Secs"),
        Column::left("Last line").max(40),
    ]
}

pub fn row(call: &CallRecord) -> Vec<String> {
    let peer = match call.direction {
        callforge_core::CallDirection::Outbound => &call.to,
        callforge_core::CallDirection::Inbound => &call.from,
    };
    let duration = match (call.answered_at, call.ended_at) {
        (Some(start), Some(end)) => (end - start).num_seconds().max(0).to_string(),
        _ => "-".to_string(),
    };
    let last_line = call
        .transcript
        .last()
        .map(|t| format!("{:?}: {}", t.speaker, t.text))
        .unwrap_or_default();
    vec![
        call.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        call.call_id.chars().take(8).collect(),
        format!("{:?}", call.direction).to_lowercase(),
        peer.clone(),
        paint_state(&call.state.to_string()),
        duration,
        last_line,
    ]
}

pub fn run(store_dir: &Path, limit: usize) -> Result<()> {
    let calls = read_history(store_dir, limit)?;
    if calls.is_empty() {
        note_info(&format!("No calls recorded in {}", store_dir.display()));
        return Ok(());
    }
    let rows: Vec<Vec<String>> = calls.iter().map(row).collect();
    print!("{}", render_table(&columns(), &rows));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal_output::strip_ansi;
    use callforge_core::{CallDirection, CallState, EndReason, ProviderKind, Speaker};

    #[test]
    fn row_shows_peer_duration_and_last_line() {
        let mut call = CallRecord::new(ProviderKind::Mock, CallDirection::Inbound, "+15550003333", "+15550001111");
        call.transition(CallState::Answered);
        call.push_transcript(Speaker::User, "hello", true);
        call.finish(EndReason::HangupUser);

        let row = row(&call);
        assert_eq!(row[2], "inbound");
        assert_eq!(row[3], "+15550003333");
        assert_eq!(strip_ansi(&row[4]), "hangup-user");
        assert_eq!(row[5], "0");
        assert_eq!(row[6], "User: hello");
    }

    #[test]
    fn unanswered_call_has_no_duration() {
        let call = CallRecord::new(ProviderKind::Mock, CallDirection::Outbound, "+15550001111", "+15550002222");
        let row = row(&call);
        assert_eq!(row[3], "+15550002222");
        assert_eq!(row[5], "-");
        assert_eq!(row[6], "");
    }

    #[test]
    fn empty_store_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), 5).unwrap();
    }
}
