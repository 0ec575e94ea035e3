//! Custom macros for reducing code repetition in vidwall

/// Log an error and continue execution (non-fatal error handling)
///
/// # Example
/// ```ignore
/// log_and_continue!(source.pause(), "pause video source");
/// ```
#[macro_export]
macro_rules! log_and_continue {
    ($expr:expr, $context:expr) => {
        if let Err(e) = $expr {
            log::error!("Failed to {}: {}", $context, e);
        }
    };
}

/// Validate that a string value is one of the allowed variants
///
/// # Example
/// ```ignore
/// validate_enum!(level, "trace", "debug", "info", "warn", "error");
/// validate_enum!(preference, "high-performance", "low-power");
/// ```
#[macro_export]
macro_rules! validate_enum {
    ($value:expr, $($variant:expr),+) => {
        match $value {
            $($variant)|+ => Ok(()),
            _ => anyhow::bail!("Invalid value: {} (expected one of: {})", $value, [$($variant),+].join(", ")),
        }
    };
}

/// Ignore a lifecycle edge that is not valid from the current state
///
/// # Example
/// ```ignore
/// guard_edge!(self.state, "visible(true)", EngineState::SurfaceReady | EngineState::Paused);
/// ```
#[macro_export]
macro_rules! guard_edge {
    ($state:expr, $edge:expr, $($allowed:pat_param)|+) => {
        if !matches!($state, $($allowed)|+) {
            log::debug!("Ignoring {} in state {:?}", $edge, $state);
            return;
        }
    };
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    fn check(value: &str) -> Result<()> {
        validate_enum!(value, "fill", "fit")
    }

    #[test]
    fn test_validate_enum() {
        assert!(check("fill").is_ok());
        let err = check("stretch").unwrap_err();
        assert!(err.to_string().contains("expected one of: fill, fit"));
    }
}
