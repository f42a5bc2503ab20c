use serde::Serialize;

use super::table::ApprovalState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonIcon {
  Save,
  Spinner,
  Check,
  Retry,
}

/// How the approve button renders. A pure function of [`ApprovalState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ButtonConfig {
  pub show: bool,
  pub enabled: bool,
  pub loading: bool,
  pub message: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub icon: Option<ButtonIcon>,
}

pub const RETRY_LABEL: &str = "Retry";

impl ButtonConfig {
  pub fn for_state(state: ApprovalState) -> Self {
    let (show, enabled, loading, message, icon) = match state {
      ApprovalState::Hidden => (false, false, false, "", None),
      ApprovalState::DisabledSaveFirst => (true, false, false, "Save Plan First", Some(ButtonIcon::Save)),
      ApprovalState::Saving => (true, false, true, "Saving...", Some(ButtonIcon::Spinner)),
      ApprovalState::Refreshing => (true, false, true, "Checking status...", Some(ButtonIcon::Spinner)),
      ApprovalState::EnabledApprove => (true, true, false, "Approve Plan", Some(ButtonIcon::Check)),
      ApprovalState::ErrorStuck => (true, true, false, RETRY_LABEL, Some(ButtonIcon::Retry)),
    };
    Self {
      show,
      enabled,
      loading,
      message,
      icon,
    }
  }
}

impl From<ApprovalState> for ButtonConfig {
  fn from(state: ApprovalState) -> Self {
    Self::for_state(state)
  }
}
