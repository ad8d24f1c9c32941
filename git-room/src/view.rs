//! Plain-text rendering of a room for terminal display.

use std::fmt::Write;

use crate::client::ConnectionState;
use crate::protocol::Participant;

/// Shown instead of the participant list while the room is empty.
pub fn status_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connecting => "Git Room: Connecting...",
        ConnectionState::Connected => "Git Room: No collaborators detected yet.",
        ConnectionState::Disconnected => "Git Room: Configure room and username to get started.",
    }
}

pub fn participant_label(participant: &Participant) -> String {
    if participant.is_local {
        format!("{} (You)", participant.display_name)
    } else {
        participant.display_name.clone()
    }
}

pub fn activity_label(participant: &Participant) -> String {
    match participant.files.len() {
        0 => "Idle".to_string(),
        1 => "1 file".to_string(),
        n => format!("{n} files"),
    }
}

/// One line per participant, each followed by its indented file paths.
pub fn render_room(participants: &[Participant], state: ConnectionState) -> String {
    if participants.is_empty() {
        return format!("{}\n", status_label(state));
    }

    let mut out = String::new();
    for participant in participants {
        let _ = writeln!(
            out,
            "{} - {}",
            participant_label(participant),
            activity_label(participant)
        );
        for file in &participant.files {
            let _ = writeln!(out, "    {file}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_room_shows_status() {
        assert_eq!(
            render_room(&[], ConnectionState::Connecting),
            "Git Room: Connecting...\n"
        );
        assert!(render_room(&[], ConnectionState::Connected).contains("No collaborators"));
        assert!(render_room(&[], ConnectionState::Disconnected).contains("Configure room"));
    }

    #[test]
    fn test_participants_listed() {
        let mut me = Participant::new("me", "Alice").with_files(["src/a.rs", "src/b.rs"]);
        me.is_local = true;
        let other = Participant::new("b1", "Bob");
        let third = Participant::new("c1", "Carol").with_files(["README.md"]);

        let text = render_room(&[me, other, third], ConnectionState::Connected);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Alice (You) - 2 files",
                "    src/a.rs",
                "    src/b.rs",
                "Bob - Idle",
                "Carol - 1 file",
                "    README.md",
            ]
        );
    }
}
