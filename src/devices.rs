//! Device enumeration: the collaborator that tells a context which devices
//! are locally visible. Placement policy lives outside the coordinator.

use crate::types::DeviceInfo;

/// Port for enumerating locally visible devices.
pub trait DeviceProvider: Send + Sync {
    fn devices(&self) -> Vec<DeviceInfo>;
}

/// Default provider exposing `count` CPU devices named `cpu:0..count`.
pub struct LocalCpuProvider {
    count: usize,
}

impl LocalCpuProvider {
    pub fn new(count: usize) -> Self {
        Self { count: count.max(1) }
    }
}

impl Default for LocalCpuProvider {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DeviceProvider for LocalCpuProvider {
    fn devices(&self) -> Vec<DeviceInfo> {
        (0..self.count)
            .map(|i| DeviceInfo {
                name: format!("cpu:{}", i),
                kind: "CPU".to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_cpu_provider_names() {
        let provider = LocalCpuProvider::new(2);
        let devices = provider.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "cpu:0");
        assert_eq!(devices[1].name, "cpu:1");
    }

    #[test]
    fn test_zero_count_clamps_to_one() {
        assert_eq!(LocalCpuProvider::new(0).devices().len(), 1);
    }
}
