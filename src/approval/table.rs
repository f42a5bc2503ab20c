use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the save/approve workflow of one editable plan currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
  /// No plan yet
  Hidden,
  /// Unsaved changes block approval
  DisabledSaveFirst,
  Saving,
  /// Verifying the saved plan can be approved
  Refreshing,
  EnabledApprove,
  /// A step failed; waiting for an explicit retry
  ErrorStuck,
}

impl ApprovalState {
  pub const ALL: [ApprovalState; 6] = [
    ApprovalState::Hidden,
    ApprovalState::DisabledSaveFirst,
    ApprovalState::Saving,
    ApprovalState::Refreshing,
    ApprovalState::EnabledApprove,
    ApprovalState::ErrorStuck,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      ApprovalState::Hidden => "hidden",
      ApprovalState::DisabledSaveFirst => "disabled_save_first",
      ApprovalState::Saving => "saving",
      ApprovalState::Refreshing => "refreshing",
      ApprovalState::EnabledApprove => "enabled_approve",
      ApprovalState::ErrorStuck => "error_stuck",
    }
  }
}

impl fmt::Display for ApprovalState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalAction {
  PlanGenerated,
  PlanImported,
  DirtyChanges,
  CleanChanges,
  SaveStart,
  SaveSuccess,
  SaveError,
  RefreshStart,
  RefreshSuccess,
  RefreshError,
  ApproveStart,
  ApproveSuccess,
  ApproveError,
  Retry,
  Reset,
}

impl ApprovalAction {
  pub const ALL: [ApprovalAction; 15] = [
    ApprovalAction::PlanGenerated,
    ApprovalAction::PlanImported,
    ApprovalAction::DirtyChanges,
    ApprovalAction::CleanChanges,
    ApprovalAction::SaveStart,
    ApprovalAction::SaveSuccess,
    ApprovalAction::SaveError,
    ApprovalAction::RefreshStart,
    ApprovalAction::RefreshSuccess,
    ApprovalAction::RefreshError,
    ApprovalAction::ApproveStart,
    ApprovalAction::ApproveSuccess,
    ApprovalAction::ApproveError,
    ApprovalAction::Retry,
    ApprovalAction::Reset,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      ApprovalAction::PlanGenerated => "PLAN_GENERATED",
      ApprovalAction::PlanImported => "PLAN_IMPORTED",
      ApprovalAction::DirtyChanges => "DIRTY_CHANGES",
      ApprovalAction::CleanChanges => "CLEAN_CHANGES",
      ApprovalAction::SaveStart => "SAVE_START",
      ApprovalAction::SaveSuccess => "SAVE_SUCCESS",
      ApprovalAction::SaveError => "SAVE_ERROR",
      ApprovalAction::RefreshStart => "REFRESH_START",
      ApprovalAction::RefreshSuccess => "REFRESH_SUCCESS",
      ApprovalAction::RefreshError => "REFRESH_ERROR",
      ApprovalAction::ApproveStart => "APPROVE_START",
      ApprovalAction::ApproveSuccess => "APPROVE_SUCCESS",
      ApprovalAction::ApproveError => "APPROVE_ERROR",
      ApprovalAction::Retry => "RETRY",
      ApprovalAction::Reset => "RESET",
    }
  }
}

impl fmt::Display for ApprovalAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Target of `action` from `state`, or `None` when the pair is not allowed.
pub fn next_state(state: ApprovalState, action: ApprovalAction) -> Option<ApprovalState> {
  use ApprovalAction as A;
  use ApprovalState as S;

  let next = match (state, action) {
    (S::Hidden, A::PlanGenerated | A::PlanImported) => S::EnabledApprove,
    (S::Hidden, A::DirtyChanges) => S::DisabledSaveFirst,
    // FIXME: "clean changes" with no plan yet lands on an enabled approve
    // button. Kept as is until product confirms whether that is intended.
    (S::Hidden, A::CleanChanges) => S::EnabledApprove,

    (S::DisabledSaveFirst, A::PlanGenerated | A::PlanImported | A::CleanChanges) => S::EnabledApprove,
    (S::DisabledSaveFirst, A::DirtyChanges) => S::DisabledSaveFirst,
    (S::DisabledSaveFirst, A::SaveStart) => S::Saving,
    (S::DisabledSaveFirst, A::Reset) => S::Hidden,

    (S::Saving, A::CleanChanges) => S::EnabledApprove,
    (S::Saving, A::SaveSuccess) => S::Refreshing,
    (S::Saving, A::SaveError | A::ApproveError) => S::ErrorStuck,
    (S::Saving, A::ApproveSuccess) => S::Hidden,
    (S::Saving, A::Retry) => S::Saving,

    (S::Refreshing, A::RefreshSuccess) => S::EnabledApprove,
    (S::Refreshing, A::RefreshError) => S::ErrorStuck,
    (S::Refreshing, A::Retry) => S::Refreshing,

    (S::EnabledApprove, A::PlanGenerated | A::PlanImported | A::CleanChanges) => S::EnabledApprove,
    (S::EnabledApprove, A::DirtyChanges) => S::DisabledSaveFirst,
    (S::EnabledApprove, A::ApproveStart) => S::Saving,
    (S::EnabledApprove, A::Reset) => S::Hidden,

    (S::ErrorStuck, A::SaveStart | A::Retry) => S::Saving,
    (S::ErrorStuck, A::RefreshStart) => S::Refreshing,
    (S::ErrorStuck, A::Reset) => S::Hidden,

    _ => return None,
  };
  Some(next)
}

pub fn can_transition(state: ApprovalState, action: ApprovalAction) -> bool {
  next_state(state, action).is_some()
}
