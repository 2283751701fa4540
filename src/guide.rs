//! Guide module for generating help content
//!
//! The same command reference is shown inside the interactive shell (`help`) and by
//! `taskstack guide`; only the framing differs.

/// Where the guide will be displayed
#[derive(Debug, Clone, Copy)]
pub enum GuideMode {
    /// Full guide printed by the `guide` subcommand
    Cli,
    /// Short reference printed by `help` inside the shell
    Shell,
}

/// Generate a guide string for the specified mode
pub fn get_guide_string(mode: GuideMode) -> String {
    match mode {
        GuideMode::Shell => format!(
            "{}\n\n{}",
            get_shell_commands_section(),
            get_history_section()
        ),
        GuideMode::Cli => format!(
            r#"=== TASKSTACK GUIDE ===

{overview}

{shell_commands}

{history}

{files}"#,
            overview = get_overview_section(),
            shell_commands = get_shell_commands_section(),
            history = get_history_section(),
            files = get_files_section(),
        ),
    }
}

fn get_overview_section() -> &'static str {
    r#"== OVERVIEW ==

taskstack keeps your tasks as a tree and works like a call stack. Adding a
subtask steps into it. Finishing or deleting a task returns you to its parent.

Start the interactive shell with:
  $ taskstack shell"#
}

fn get_shell_commands_section() -> &'static str {
    r#"== SHELL COMMANDS ==

  add <title>          Add a subtask under the focused task and focus it
  sibling <title>      Add a task next to the focused task
  rename <title>       Rename the focused task
  focus <id>           Focus another task
  done [id]            Complete a task (default: focused) and return to its parent
  delete [id]          Delete a task and its subtasks, returning to its parent
  undo / redo          Step through history (up to 200 steps)
  tree                 Print the current tree
  save                 Write everything to disk and resume here next start
  help                 Show this reference
  quit                 Flush pending writes and exit"#
}

fn get_history_section() -> &'static str {
    r#"== HISTORY ==

  sessions             List recorded sessions, newest first
  events [session]     Show the event log of a session (default: current)
  snapshots            List archived sessions, newest first
  restore <snapshot>   Start a new session from an archived snapshot"#
}

fn get_files_section() -> &'static str {
    r#"== FILES ==

All data lives in the data directory (--data-dir or TASKSTACK_DATA_DIR):
  active.json                 The live session, replaced atomically
  continue.flag               Present after `save`; the next start resumes
  <session>.events.log        One line per command, append-only
  <session>.snapshot.json     Final state of an archived session

Without `save`, each start archives the previous session and begins fresh."#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_guide_contains_every_section() {
        let guide = get_guide_string(GuideMode::Cli);
        for section in ["OVERVIEW", "SHELL COMMANDS", "HISTORY", "FILES"] {
            assert!(guide.contains(section), "missing {}", section);
        }
    }

    #[test]
    fn test_shell_guide_is_reference_only() {
        let guide = get_guide_string(GuideMode::Shell);
        assert!(guide.contains("undo / redo"));
        assert!(!guide.contains("OVERVIEW"));
    }
}
