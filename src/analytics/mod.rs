pub mod pass_through;
pub mod velocity;

pub use pass_through::{compute_funnel_pass_through, compute_stage_pass_through};
pub use velocity::{compute_funnel_average_velocity, compute_stage_velocity};
