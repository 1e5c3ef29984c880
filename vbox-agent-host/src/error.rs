//! Error taxonomy for the VBoxManage layer

/// Errors raised while driving VirtualBox through `VBoxManage`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VBoxError {
    #[error("VBoxManage command {method} failed. More information: {reason}")]
    Manage { method: String, reason: String },
    #[error("Instance {instance} could not be found.")]
    InstanceNotFound { instance: String },
    #[error("Instance {instance} cannot {method} while the instance is in this state: {details}")]
    InvalidState {
        instance: String,
        method: String,
        details: String,
    },
}

impl VBoxError {
    pub fn manage(method: impl Into<String>, reason: impl Into<String>) -> Self {
        VBoxError::Manage {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// The VM was not in a power state that allows the requested change
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, VBoxError::InvalidState { .. })
    }
}

pub type VBoxResult<T> = std::result::Result<T, VBoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = VBoxError::manage("modifyvm", "boom");
        assert_eq!(
            err.to_string(),
            "VBoxManage command modifyvm failed. More information: boom"
        );
        assert!(!err.is_invalid_state());

        let err = VBoxError::InvalidState {
            instance: "vm-1".to_string(),
            method: "showvminfo".to_string(),
            details: "Machine in invalid state".to_string(),
        };
        assert!(err.is_invalid_state());
        assert!(err.to_string().contains("vm-1"));
    }
}
