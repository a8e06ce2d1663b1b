//! Contracts for collaborators that live outside the core: interactive
//! password entry, hardware sizing, and timezone resolution. Library
//! messages and warnings go through `tracing`; subscribers are the
//! message sink.

use std::time::Duration;

use med_core::error::{MedError, Result};
use med_core::metadata::MetadataSection3;

/// Default timeout for interactive password prompts.
pub const PASSWORD_PROMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interactive password entry. `hint` is the stored hint for the level
/// being requested, when one is readable.
pub trait PasswordPrompt {
    fn prompt(&self, hint: Option<&str>, timeout: Duration) -> Result<String>;
}

/// Host performance characteristics used to size worker pools and
/// buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    pub logical_cores: usize,
    pub memory_bytes: u64,
}

pub trait HardwareSpecs {
    fn performance_specs(&self) -> HwParams;
}

/// Resolves recording timezone state from section 3 of the metadata,
/// prompting when observance is ambiguous.
pub trait TimezoneResolver {
    fn set_global_time_constants(
        &self,
        section_3: &MetadataSection3,
        session_start_time: i64,
        prompt_if_ambiguous: bool,
    ) -> Result<()>;
}

/// Open a session, reprompting once through the collaborator when the
/// first attempt is rejected with a hint.
pub fn open_with_prompt(
    directory: &std::path::Path,
    prompt: &dyn PasswordPrompt,
) -> Result<crate::Session> {
    match crate::Session::open(directory, None) {
        Ok(session) => Ok(session),
        Err(MedError::BadPassword { hint }) => {
            let password = prompt.prompt(hint.as_deref(), PASSWORD_PROMPT_TIMEOUT)?;
            crate::Session::open(directory, Some(&password))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPassword(&'static str);

    impl PasswordPrompt for FixedPassword {
        fn prompt(&self, hint: Option<&str>, _timeout: Duration) -> Result<String> {
            assert!(hint.is_some());
            Ok(self.0.to_owned())
        }
    }

    #[test]
    fn prompt_trait_is_object_safe() {
        let prompt: &dyn PasswordPrompt = &FixedPassword("patient");
        let password = prompt.prompt(Some("first pet"), PASSWORD_PROMPT_TIMEOUT).unwrap();
        assert_eq!(password, "patient");
    }
}
