use colored::Colorize;

use super::theme::{Colors, paint};
use crate::monitor::StatusEvent;

pub fn render_status(event: &StatusEvent) -> String {
    let (badge, color, detail) = match event {
        StatusEvent::InSync => ("in sync", Colors::OK, String::new()),
        StatusEvent::Disabled => (
            "disabled",
            Colors::TEXT_MUTED,
            "canonical content is empty, repair is off".to_string(),
        ),
        StatusEvent::Repaired { bytes } => {
            ("repaired", Colors::ACCENT, format!("wrote {bytes} bytes"))
        }
        StatusEvent::WriteFailed {
            reason,
            permission_denied,
        } => {
            let hint = if *permission_denied {
                " (run with administrator rights)"
            } else {
                ""
            };
            ("write failed", Colors::ERROR, format!("{reason}{hint}"))
        }
        StatusEvent::Degraded { reason } => ("degraded", Colors::WARN, reason.clone()),
        StatusEvent::Recovered => ("recovered", Colors::OK, "watching again".to_string()),
    };

    let badge = paint(&format!("[{badge}]"), color).bold();
    if detail.is_empty() {
        badge.to_string()
    } else {
        format!("{badge} {}", paint(&detail, Colors::TEXT))
    }
}
