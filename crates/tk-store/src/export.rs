// export.rs — Markdown progress report for a store snapshot.

use std::fmt::Write;

use crate::status::TaskStatus;
use crate::task::{StoreState, Task};

/// Number of tasks in each status, in lifecycle order. Zero counts included.
pub fn status_counts(tasks: &[Task]) -> Vec<(TaskStatus, usize)> {
    TaskStatus::ALL
        .iter()
        .map(|status| (status.clone(), tasks.iter().filter(|t| t.status == *status).count()))
        .collect()
}

/// Render a markdown report: a status summary table followed by a
/// checklist of tasks (and their subtasks) in file order.
pub fn render_progress_markdown(state: &StoreState) -> String {
    let mut out = String::new();
    let total = state.tasks.len();
    let done = state.tasks.iter().filter(|t| t.is_done()).count();
    let percent = if total == 0 { 0 } else { done * 100 / total };

    // Writing to a String never fails.
    let _ = writeln!(out, "# {}", state.meta.project_name);
    if !state.meta.description.is_empty() {
        let _ = writeln!(out, "\n{}", state.meta.description);
    }
    let _ = writeln!(out, "\n**Progress:** {done}/{total} tasks done ({percent}%)\n");

    let _ = writeln!(out, "| Status | Tasks |");
    let _ = writeln!(out, "|---|---|");
    for (status, count) in status_counts(&state.tasks) {
        let _ = writeln!(out, "| {status} | {count} |");
    }

    if state.tasks.is_empty() {
        return out;
    }

    let _ = writeln!(out, "\n## Tasks\n");
    for task in &state.tasks {
        let mark = if task.is_done() { "x" } else { " " };
        let _ = write!(out, "- [{mark}] **{}.** {} `{}`", task.id, task.title, task.status);
        if !task.dependencies.is_empty() {
            let deps: Vec<String> = task.dependencies.iter().map(u64::to_string).collect();
            let _ = write!(out, " (depends on {})", deps.join(", "));
        }
        out.push('\n');

        for subtask in &task.subtasks {
            let mark = if subtask.is_done() { "x" } else { " " };
            let _ = writeln!(
                out,
                "  - [{mark}] {}.{} {}",
                task.id, subtask.id, subtask.title
            );
        }
    }
    out
}
