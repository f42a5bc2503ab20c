//! Save/approve workflow for an editable plan and the button it drives.

mod button;
mod machine;
mod table;

pub use button::{ButtonConfig, ButtonIcon, RETRY_LABEL};
pub use machine::{
  ApprovalMachine, ApproveOutcome, RefreshOutcome, RetryInfo, SaveOutcome, Subscription,
};
pub use table::{can_transition, next_state, ApprovalAction, ApprovalState};
