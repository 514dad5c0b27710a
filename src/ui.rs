pub mod drift_view;
pub mod status_view;
pub mod theme;
