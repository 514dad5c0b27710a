use std::path::Path;

use super::theme::{Colors, paint};
use crate::monitor::{Drift, DriftLine};

pub fn render_drift(path: &Path, drift: &Drift) -> String {
    let mut out = format!(
        "{} {}\n",
        paint(&path.display().to_string(), Colors::ACCENT),
        paint(
            &format!("(+{} -{})", drift.added(), drift.removed()),
            Colors::TEXT_MUTED
        ),
    );

    for line in &drift.lines {
        let (prefix, text, color) = match line {
            DriftLine::Context(text) => (" ", text, Colors::TEXT_SUBTLE),
            DriftLine::Added(text) => ("+", text, Colors::ADDED),
            DriftLine::Removed(text) => ("-", text, Colors::REMOVED),
        };
        let text = text.trim_end_matches(['\r', '\n']);
        out.push_str(&paint(&format!("{prefix} {text}"), color).to_string());
        out.push('\n');
    }

    out
}
