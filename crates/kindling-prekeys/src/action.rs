use std::fmt;

/// The kinds of pre-key task, and the policy each one runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreKeyAction {
    CreateForRegistration,
    CreateForProvisioning,
    PersistAfterRegistration,
    Refresh,
    Rotate,
    CreateOneTimePreKeys,
    CreateOrRotatePniKeys,
}

impl PreKeyAction {
    /// Whether a missing identity key may be generated rather than failing
    /// with `NoIdentityKey`.
    pub fn may_create_identity_key(self) -> bool {
        matches!(
            self,
            PreKeyAction::CreateForRegistration | PreKeyAction::CreateOrRotatePniKeys
        )
    }

    /// Whether requested targets are narrowed to those actually due.
    pub fn filters_targets(self) -> bool {
        self == PreKeyAction::Refresh
    }

    /// Whether the task waits for message processing before generating.
    pub fn waits_for_message_processing(self) -> bool {
        matches!(
            self,
            PreKeyAction::Refresh | PreKeyAction::Rotate | PreKeyAction::CreateOrRotatePniKeys
        )
    }

    /// Whether keys are stored before the upload rather than after it.
    pub fn persists_prior_to_upload(self) -> bool {
        matches!(
            self,
            PreKeyAction::CreateForRegistration | PreKeyAction::CreateForProvisioning
        )
    }
}

impl fmt::Display for PreKeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PreKeyAction::CreateForRegistration => "create_for_registration",
            PreKeyAction::CreateForProvisioning => "create_for_provisioning",
            PreKeyAction::PersistAfterRegistration => "persist_after_registration",
            PreKeyAction::Refresh => "refresh",
            PreKeyAction::Rotate => "rotate",
            PreKeyAction::CreateOneTimePreKeys => "create_one_time_pre_keys",
            PreKeyAction::CreateOrRotatePniKeys => "create_or_rotate_pni_keys",
        })
    }
}
