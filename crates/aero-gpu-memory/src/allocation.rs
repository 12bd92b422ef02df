use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagerConfig {
    /// Budget shared by every client in the process.
    pub total_bytes_available: u64,
    pub min_bytes_per_client: u64,
    pub max_bytes_per_client: u64,
    /// Assumed requirement for visible clients that never reported stats.
    pub default_bytes_per_client: u64,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            total_bytes_available: 512 * MIB,
            min_bytes_per_client: 8 * MIB,
            max_bytes_per_client: 256 * MIB,
            default_bytes_per_client: 64 * MIB,
        }
    }
}

/// Which allocations a client should keep resident.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityCutoff {
    Nothing,
    Required,
    NiceToHave,
    Everything,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryAllocation {
    pub bytes_limit: u64,
    pub visible: bool,
    pub priority_cutoff: PriorityCutoff,
}

impl MemoryAllocation {
    pub const NONVISIBLE: MemoryAllocation = MemoryAllocation {
        bytes_limit: 0,
        visible: false,
        priority_cutoff: PriorityCutoff::Nothing,
    };
}

/// Producer-reported usage of managed (evictable) resources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedMemoryStats {
    pub bytes_required: u64,
    pub bytes_nice_to_have: u64,
    pub bytes_allocated: u64,
}

impl ManagedMemoryStats {
    fn is_reported(&self) -> bool {
        *self != Self::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPool {
    /// Resources the client can evict when its allocation shrinks.
    Managed,
    Unmanaged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientInputs {
    pub visible: bool,
    pub stats: ManagedMemoryStats,
}

/// Computes one allocation per client, in input order.
///
/// Visible clients split whatever the unmanaged pool leaves over:
/// 1. everybody gets what they would like when it all fits,
/// 2. otherwise everybody gets their requirement and the remainder is shared in proportion to
///    how much each client wanted beyond it,
/// 3. otherwise requirements are scaled down proportionally (never below the per-client
///    minimum).
///
/// Non-visible clients are asked to drop everything.
pub fn compute_allocations(
    config: &MemoryManagerConfig,
    unmanaged_bytes: u64,
    clients: &[ClientInputs],
) -> Vec<MemoryAllocation> {
    let available = config.total_bytes_available.saturating_sub(unmanaged_bytes);
    let clamp = |bytes: u64| {
        bytes
            .max(config.min_bytes_per_client)
            .min(config.max_bytes_per_client.max(config.min_bytes_per_client))
    };

    let wants: Vec<Option<(u64, u64)>> = clients
        .iter()
        .map(|client| {
            if !client.visible {
                return None;
            }
            let (required, wanted) = if client.stats.is_reported() {
                let required = clamp(client.stats.bytes_required);
                let wanted = clamp(client.stats.bytes_nice_to_have.max(required));
                (required, wanted)
            } else {
                let default = clamp(config.default_bytes_per_client);
                (default, default)
            };
            Some((required, wanted))
        })
        .collect();

    let sum_required: u128 = wants.iter().flatten().map(|&(r, _)| u128::from(r)).sum();
    let sum_wanted: u128 = wants.iter().flatten().map(|&(_, w)| u128::from(w)).sum();
    let available_wide = u128::from(available);

    wants
        .into_iter()
        .map(|want| {
            let Some((required, wanted)) = want else {
                return MemoryAllocation::NONVISIBLE;
            };

            let granted = if sum_wanted <= available_wide {
                wanted
            } else if sum_required <= available_wide {
                let extra = available_wide - sum_required;
                let spread = sum_wanted - sum_required;
                let share = extra * u128::from(wanted - required) / spread.max(1);
                required + share as u64
            } else {
                let scaled = available_wide * u128::from(required) / sum_required.max(1);
                (scaled as u64).max(config.min_bytes_per_client)
            };

            let priority_cutoff = if granted >= wanted {
                PriorityCutoff::NiceToHave
            } else {
                PriorityCutoff::Required
            };

            MemoryAllocation {
                bytes_limit: granted,
                visible: true,
                priority_cutoff,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> MemoryManagerConfig {
        MemoryManagerConfig {
            total_bytes_available: 100,
            min_bytes_per_client: 5,
            max_bytes_per_client: 80,
            default_bytes_per_client: 20,
        }
    }

    fn visible(required: u64, nice: u64) -> ClientInputs {
        ClientInputs {
            visible: true,
            stats: ManagedMemoryStats {
                bytes_required: required,
                bytes_nice_to_have: nice,
                bytes_allocated: 0,
            },
        }
    }

    #[test]
    fn everybody_gets_what_they_want_when_it_fits() {
        let out = compute_allocations(&config(), 0, &[visible(10, 30), visible(20, 40)]);
        assert_eq!(out[0].bytes_limit, 30);
        assert_eq!(out[1].bytes_limit, 40);
        assert!(out.iter().all(|a| a.priority_cutoff == PriorityCutoff::NiceToHave));
    }

    #[test]
    fn surplus_above_requirements_is_shared_proportionally() {
        // Required 20 + 20, wanted 60 + 80 (clamped to 80). Budget 100 leaves 60 extra, split
        // 40:60 by desire beyond requirement.
        let out = compute_allocations(&config(), 0, &[visible(20, 60), visible(20, 90)]);
        assert_eq!(out[0].bytes_limit, 20 + 24);
        assert_eq!(out[1].bytes_limit, 20 + 36);
        assert!(out.iter().all(|a| a.priority_cutoff == PriorityCutoff::Required));
    }

    #[test]
    fn requirements_scale_down_under_pressure() {
        let out = compute_allocations(&config(), 40, &[visible(60, 60), visible(60, 60)]);
        assert_eq!(out[0].bytes_limit, 30);
        assert_eq!(out[1].bytes_limit, 30);
    }

    #[test]
    fn nonvisible_clients_drop_everything() {
        let hidden = ClientInputs {
            visible: false,
            stats: ManagedMemoryStats::default(),
        };
        let out = compute_allocations(&config(), 0, &[hidden, visible(0, 0)]);
        assert_eq!(out[0], MemoryAllocation::NONVISIBLE);
        // Unreported stats fall back to the default requirement.
        assert_eq!(out[1].bytes_limit, 20);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: MemoryManagerConfig =
            serde_json::from_str(r#"{"total_bytes_available": 1024}"#).unwrap();
        assert_eq!(cfg.total_bytes_available, 1024);
        assert_eq!(
            cfg.min_bytes_per_client,
            MemoryManagerConfig::default().min_bytes_per_client
        );
    }
}
