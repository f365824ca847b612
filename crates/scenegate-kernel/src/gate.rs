//! Capability policy gate: host-stability check followed by hard argument
//! bounds. Both checks fail closed.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::host::SceneHost;

/// Hard caps on numeric arguments, keyed by lower-case argument name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SanityLimits {
    caps: IndexMap<String, f64>,
}

impl Default for SanityLimits {
    fn default() -> Self {
        let mut caps = IndexMap::new();
        caps.insert("intensity".to_string(), 10_000.0);
        caps.insert("range".to_string(), 1_000.0);
        caps.insert("maxsize".to_string(), 4_096.0);
        caps.insert("count".to_string(), 50.0);
        Self { caps }
    }
}

impl SanityLimits {
    pub fn empty() -> Self {
        Self {
            caps: IndexMap::new(),
        }
    }

    pub fn with_cap(mut self, key: &str, cap: f64) -> Self {
        self.caps.insert(key.to_ascii_lowercase(), cap);
        self
    }

    pub fn cap(&self, key: &str) -> Option<f64> {
        self.caps.get(&key.to_ascii_lowercase()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.caps.iter().map(|(key, cap)| (key.as_str(), *cap))
    }

    /// Rejects the first bounded argument whose numeric value exceeds its cap.
    /// Non-numeric values are left to the handler; non-finite ones are
    /// rejected.
    pub fn check(&self, args: &IndexMap<String, String>) -> Result<(), KernelError> {
        for (key, raw) in args {
            let Some(cap) = self.cap(key) else {
                continue;
            };
            let Ok(value) = raw.trim().parse::<f64>() else {
                continue;
            };
            if !value.is_finite() || value > cap {
                log::warn!("sanity bound rejected {key}={raw} (cap {cap})");
                return Err(KernelError::SanityRejected {
                    key: key.to_ascii_lowercase(),
                    value,
                    cap,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityGate {
    limits: SanityLimits,
}

impl CapabilityGate {
    pub fn new(limits: SanityLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SanityLimits {
        &self.limits
    }

    /// Host-stability check alone. A host that cannot report its state is
    /// treated as unstable.
    pub fn check_stability<H: SceneHost + ?Sized>(&self, host: &H) -> Result<(), KernelError> {
        match host.stability() {
            Ok(stability) if stability.is_stable() => Ok(()),
            Ok(stability) => {
                let reasons = stability.unstable_reasons().join(", ");
                log::warn!("gate rejected mutation: host is {reasons}");
                Err(KernelError::UnsafeState(reasons))
            }
            Err(err) => {
                log::warn!("gate rejected mutation: {err}");
                Err(KernelError::UnsafeState(format!("unreachable ({err})")))
            }
        }
    }

    /// Full gate: stability first, then sanity bounds. Stops at the first
    /// failure.
    pub fn check<H: SceneHost + ?Sized>(
        &self,
        host: &H,
        args: &IndexMap<String, String>,
    ) -> Result<(), KernelError> {
        self.check_stability(host)?;
        self.limits.check(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimScene;

    fn args(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn intensity_over_cap_is_named_in_error() {
        let err = SanityLimits::default()
            .check(&args(&[("intensity", "50000")]))
            .unwrap_err();
        assert_eq!(err.code(), "SANITY_REJECTED");
        let msg = err.to_string();
        assert!(msg.contains("intensity"), "{msg}");
        assert!(msg.contains("10000"), "{msg}");
    }

    #[test]
    fn keys_match_case_insensitively() {
        assert!(SanityLimits::default().check(&args(&[("MaxSize", "8192")])).is_err());
        assert!(SanityLimits::default().check(&args(&[("Range", "999")])).is_ok());
    }

    #[test]
    fn non_numeric_passes_but_infinity_does_not() {
        let limits = SanityLimits::default();
        assert!(limits.check(&args(&[("intensity", "bright")])).is_ok());
        assert!(limits.check(&args(&[("intensity", "inf")])).is_err());
    }

    #[test]
    fn extra_caps_apply() {
        let limits = SanityLimits::empty().with_cap("Depth", 8.0);
        assert!(limits.check(&args(&[("depth", "9")])).is_err());
        assert!(limits.check(&args(&[("intensity", "1e9")])).is_ok());
    }

    #[test]
    fn unstable_host_is_rejected_before_sanity() {
        let mut scene = SimScene::new();
        scene.stability_mut().compiling = true;
        let gate = CapabilityGate::default();
        let err = gate.check(&scene, &args(&[("intensity", "50000")])).unwrap_err();
        assert_eq!(err.code(), "UNSAFE_STATE");
        assert!(err.to_string().starts_with("UNSAFE_STATE"));
    }

    #[test]
    fn failing_stability_probe_fails_closed() {
        let mut scene = SimScene::new();
        scene.fail_stability_probe(true);
        let err = CapabilityGate::default().check_stability(&scene).unwrap_err();
        assert!(matches!(err, KernelError::UnsafeState(_)));
    }
}
