//! Attribution keys and the resolver that derives them from hook context.

use std::fmt;
use std::sync::Arc;

use deltascope_common::{AggKey, NO_STACK, ProbeKind};
use serde::Serialize;

use super::comm::Comm;
use super::slots::SlotKey;
use super::stacks::{StackId, StackTable};

/// Raw context handed to a hook callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookContext<'a> {
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    /// Resource the operation is about: fault address, allocation, irq line.
    pub address: Option<u64>,
    pub user_stack: Option<&'a [u64]>,
    pub kernel_stack: Option<&'a [u64]>,
    pub comm: Option<Comm>,
}

impl<'a> HookContext<'a> {
    pub fn new(pid: u32, tid: u32, cpu: u32) -> Self {
        Self {
            pid,
            tid,
            cpu,
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_stacks(mut self, user: Option<&'a [u64]>, kernel: Option<&'a [u64]>) -> Self {
        self.user_stack = user;
        self.kernel_stack = kernel;
        self
    }

    pub fn with_comm(mut self, comm: Comm) -> Self {
        self.comm = Some(comm);
        self
    }
}

/// Key that a delta is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Identity {
    BySubject {
        pid: u32,
    },
    /// A disabled stack component is `None`.
    BySubjectAndStacks {
        pid: u32,
        user: Option<StackId>,
        kernel: Option<StackId>,
    },
    ByAddress {
        addr: u64,
    },
}

impl Identity {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Identity::BySubject { pid } | Identity::BySubjectAndStacks { pid, .. } => Some(*pid),
            Identity::ByAddress { .. } => None,
        }
    }

    pub fn has_unknown_stack(&self) -> bool {
        match self {
            Identity::BySubjectAndStacks { user, kernel, .. } => {
                user.is_some_and(StackId::is_unknown) || kernel.is_some_and(StackId::is_unknown)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::BySubject { pid } => write!(f, "pid={pid}"),
            Identity::BySubjectAndStacks { pid, user, kernel } => {
                write!(f, "pid={pid}")?;
                for (label, id) in [("ustack", user), ("kstack", kernel)] {
                    match id {
                        Some(id) if id.is_unknown() => write!(f, " {label}=?")?,
                        Some(id) => write!(f, " {label}={}", id.0)?,
                        None => {}
                    }
                }
                Ok(())
            }
            Identity::ByAddress { addr } => write!(f, "addr={addr:#x}"),
        }
    }
}

const TAG_SUBJECT: u64 = 1;
const TAG_STACKS: u64 = 2;
const TAG_ADDRESS: u64 = 3;
const NO_ID: u32 = u32::MAX;

fn stack_word(id: Option<StackId>) -> u64 {
    id.map_or(NO_ID, |id| id.0) as u64
}

fn stack_from_word(word: u32) -> Option<StackId> {
    (word != NO_ID).then_some(StackId(word))
}

impl SlotKey for Identity {
    fn to_words(&self) -> [u64; 2] {
        match *self {
            Identity::BySubject { pid } => [TAG_SUBJECT << 56 | pid as u64, 0],
            Identity::BySubjectAndStacks { pid, user, kernel } => [
                TAG_STACKS << 56 | pid as u64,
                stack_word(user) << 32 | stack_word(kernel),
            ],
            Identity::ByAddress { addr } => [TAG_ADDRESS << 56, addr],
        }
    }

    fn from_words(words: [u64; 2]) -> Self {
        let pid = words[0] as u32;
        match words[0] >> 56 {
            TAG_SUBJECT => Identity::BySubject { pid },
            TAG_STACKS => Identity::BySubjectAndStacks {
                pid,
                user: stack_from_word((words[1] >> 32) as u32),
                kernel: stack_from_word(words[1] as u32),
            },
            _ => Identity::ByAddress { addr: words[1] },
        }
    }
}

/// `NO_STACK` is a disabled component; `STACK_UNKNOWN` and any other
/// negative value is a failed capture.
fn kernel_stack_id(raw: i32) -> Option<StackId> {
    match raw {
        NO_STACK => None,
        id if id < 0 => Some(StackId::UNKNOWN),
        id => Some(StackId(id as u32)),
    }
}

impl From<AggKey> for Identity {
    /// Maps a key read from the kernel `AGGREGATES` map.
    fn from(key: AggKey) -> Self {
        if ProbeKind::from_u32(key.kind).is_some_and(ProbeKind::attributes_address) {
            return Identity::ByAddress { addr: key.addr };
        }
        if key.usid == NO_STACK && key.ksid == NO_STACK {
            return Identity::BySubject { pid: key.pid };
        }
        Identity::BySubjectAndStacks {
            pid: key.pid,
            user: kernel_stack_id(key.usid),
            kernel: kernel_stack_id(key.ksid),
        }
    }
}

/// Whether deltas are attributed to the subject or to the resource address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributionScope {
    #[default]
    Subject,
    Address,
}

/// Selects the components of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdentityConfig {
    pub scope: AttributionScope,
    pub user_stack: bool,
    pub kernel_stack: bool,
}

impl IdentityConfig {
    pub const SUBJECT: IdentityConfig = IdentityConfig {
        scope: AttributionScope::Subject,
        user_stack: false,
        kernel_stack: false,
    };

    pub const ADDRESS: IdentityConfig = IdentityConfig {
        scope: AttributionScope::Address,
        user_stack: false,
        kernel_stack: false,
    };

    pub fn uses_stacks(&self) -> bool {
        self.user_stack || self.kernel_stack
    }
}

pub struct IdentityResolver {
    config: IdentityConfig,
    stacks: Arc<StackTable>,
}

impl IdentityResolver {
    pub fn new(config: IdentityConfig, stacks: Arc<StackTable>) -> Self {
        Self { config, stacks }
    }

    pub fn config(&self) -> IdentityConfig {
        self.config
    }

    pub fn stacks(&self) -> &Arc<StackTable> {
        &self.stacks
    }

    /// Derives the identity from `ctx` alone, apart from interning stacks.
    /// Address attribution without an address falls back to the subject.
    pub fn resolve(&self, ctx: &HookContext<'_>) -> Identity {
        if self.config.scope == AttributionScope::Address {
            if let Some(addr) = ctx.address {
                return Identity::ByAddress { addr };
            }
        }
        if !self.config.uses_stacks() {
            return Identity::BySubject { pid: ctx.pid };
        }
        Identity::BySubjectAndStacks {
            pid: ctx.pid,
            user: self
                .config
                .user_stack
                .then(|| self.stack_id(ctx.user_stack)),
            kernel: self
                .config
                .kernel_stack
                .then(|| self.stack_id(ctx.kernel_stack)),
        }
    }

    fn stack_id(&self, frames: Option<&[u64]>) -> StackId {
        match frames {
            Some(frames) => self.stacks.intern(frames),
            None => StackId::UNKNOWN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltascope_common::STACK_UNKNOWN;

    fn resolver(config: IdentityConfig) -> IdentityResolver {
        IdentityResolver::new(config, Arc::new(StackTable::new(64).unwrap()))
    }

    #[test]
    fn subject_identity_ignores_stacks() {
        let r = resolver(IdentityConfig::SUBJECT);
        let frames = [1u64, 2, 3];
        let ctx = HookContext::new(42, 43, 0).with_stacks(Some(&frames), None);
        assert_eq!(r.resolve(&ctx), Identity::BySubject { pid: 42 });
    }

    #[test]
    fn stack_components_follow_config() {
        let user = [0x400000u64, 0x400100];
        let kernel = [0xffff_ffff_8100_0000u64];
        let ctx = HookContext::new(7, 7, 1).with_stacks(Some(&user), Some(&kernel));

        let both = resolver(IdentityConfig {
            user_stack: true,
            kernel_stack: true,
            ..IdentityConfig::SUBJECT
        });
        let Identity::BySubjectAndStacks { pid, user: u, kernel: k } = both.resolve(&ctx) else {
            panic!("expected stack identity");
        };
        assert_eq!(pid, 7);
        assert!(u.is_some() && k.is_some());
        assert_ne!(u, k);

        let user_only = resolver(IdentityConfig {
            user_stack: true,
            ..IdentityConfig::SUBJECT
        });
        assert!(matches!(
            user_only.resolve(&ctx),
            Identity::BySubjectAndStacks { kernel: None, user: Some(_), .. }
        ));
    }

    #[test]
    fn resolution_is_deterministic() {
        let r = resolver(IdentityConfig {
            kernel_stack: true,
            ..IdentityConfig::SUBJECT
        });
        let kernel = [5u64, 6, 7];
        let ctx = HookContext::new(9, 9, 0).with_stacks(None, Some(&kernel));
        assert_eq!(r.resolve(&ctx), r.resolve(&ctx));
    }

    #[test]
    fn missing_stack_is_unknown() {
        let r = resolver(IdentityConfig {
            user_stack: true,
            ..IdentityConfig::SUBJECT
        });
        let id = r.resolve(&HookContext::new(3, 3, 0));
        assert!(id.has_unknown_stack());
    }

    #[test]
    fn address_scope_falls_back_to_subject() {
        let r = resolver(IdentityConfig::ADDRESS);
        let with = HookContext::new(11, 11, 0).with_address(0xfee0_0000);
        assert_eq!(r.resolve(&with), Identity::ByAddress { addr: 0xfee0_0000 });
        assert_eq!(
            r.resolve(&HookContext::new(11, 11, 0)),
            Identity::BySubject { pid: 11 }
        );
    }

    #[test]
    fn identity_words_round_trip() {
        for id in [
            Identity::BySubject { pid: 0 },
            Identity::BySubject { pid: u32::MAX },
            Identity::BySubjectAndStacks { pid: 5, user: None, kernel: Some(StackId(3)) },
            Identity::BySubjectAndStacks { pid: 5, user: Some(StackId::UNKNOWN), kernel: None },
            Identity::ByAddress { addr: 0 },
            Identity::ByAddress { addr: u64::MAX },
        ] {
            assert_eq!(Identity::from_words(id.to_words()), id);
        }
        assert_ne!(
            Identity::BySubject { pid: 1 }.to_words(),
            Identity::BySubjectAndStacks { pid: 1, user: None, kernel: None }.to_words()
        );
    }

    #[test]
    fn kernel_keys_map_to_identities() {
        assert_eq!(
            Identity::from(AggKey::subject(ProbeKind::SchedDelay, 12)),
            Identity::BySubject { pid: 12 }
        );
        assert_eq!(
            Identity::from(AggKey::address(ProbeKind::KvmPageFault, 0x1000)),
            Identity::ByAddress { addr: 0x1000 }
        );
        let stacked = AggKey {
            usid: 4,
            ksid: STACK_UNKNOWN,
            ..AggKey::subject(ProbeKind::OffCpu, 8)
        };
        assert_eq!(
            Identity::from(stacked),
            Identity::BySubjectAndStacks {
                pid: 8,
                user: Some(StackId(4)),
                kernel: Some(StackId::UNKNOWN),
            }
        );
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(Identity::BySubject { pid: 7 }.to_string(), "pid=7");
        assert_eq!(Identity::ByAddress { addr: 0x10 }.to_string(), "addr=0x10");
        let stacked = Identity::BySubjectAndStacks {
            pid: 7,
            user: None,
            kernel: Some(StackId::UNKNOWN),
        };
        assert_eq!(stacked.to_string(), "pid=7 kstack=?");
    }
}
