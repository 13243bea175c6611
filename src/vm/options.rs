use serde::Deserialize;

/// Tunables for a VM instance and the binding layer on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Nested script/native calls allowed before "stack overflow".
    pub max_call_depth: usize,
    /// Native stack the VM may use below its outermost call before
    /// "stack overflow". Keep it under the smallest thread stack in use.
    pub max_stack_bytes: usize,
    /// Install the default library when the session is created.
    pub open_libs: bool,
    /// Deepest table nesting converted eagerly into a host map.
    pub max_conversion_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_call_depth: 100,
            max_stack_bytes: 1 << 20,
            open_libs: false,
            max_conversion_depth: 64,
        }
    }
}

impl Options {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let opts = Options::from_json(r#"{"open_libs": true}"#).unwrap();
        assert!(opts.open_libs);
        assert_eq!(opts.max_call_depth, 100);
        assert_eq!(opts.max_conversion_depth, 64);
        assert_eq!(opts.max_stack_bytes, 1 << 20);
    }

    #[test]
    fn stack_budget_is_configurable() {
        let opts = Options::from_json(r#"{"max_stack_bytes": 65536}"#).unwrap();
        assert_eq!(opts.max_stack_bytes, 65536);
        assert_eq!(opts.max_call_depth, 100);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(Options::from_json(r#"{"max_depth": 3}"#).is_err());
    }
}
