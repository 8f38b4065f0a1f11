//! Human-readable alias allocation
//!
//! Aliases are unique among live leases. A caller-requested alias is used
//! verbatim when it is free; otherwise a random `exposed-<adjective>-<animal>-<suffix>`
//! name is generated.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

use crate::error::AllocationError;

/// Generation attempts before giving up
pub const MAX_ALIAS_ATTEMPTS: usize = 100;

const SUFFIX_LEN: usize = 4;
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "daring", "eager",
    "fancy", "gentle", "golden", "happy", "jolly", "keen", "lively", "lucky", "mellow", "misty",
    "nimble", "proud", "quick", "quiet", "rapid", "shiny", "silent", "snowy", "sunny", "swift",
    "tidy", "vivid", "witty", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "cobra", "crane", "dingo", "dolphin", "eagle", "falcon", "ferret",
    "gecko", "heron", "ibex", "jaguar", "koala", "lemur", "lynx", "marmot", "moose", "narwhal",
    "otter", "panda", "puffin", "quokka", "raven", "salmon", "seal", "tapir", "tiger", "toucan",
    "walrus", "wombat", "yak", "zebra",
];

/// Generate a random alias such as `exposed-swift-otter-k3x9`
pub fn generate_alias() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();

    format!("exposed-{}-{}-{}", adjective, animal, suffix)
}

type AliasGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Registry of aliases held by live leases
pub struct AliasAllocator {
    taken: Mutex<HashSet<String>>,
    generator: AliasGenerator,
}

impl AliasAllocator {
    pub fn new() -> Self {
        Self::with_generator(generate_alias)
    }

    /// Use a custom name generator (deterministic names in tests)
    pub fn with_generator<F>(generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            taken: Mutex::new(HashSet::new()),
            generator: Box::new(generator),
        }
    }

    /// Reserve an alias, preferring `requested` when it is non-empty and free
    pub fn allocate(&self, requested: Option<&str>) -> Result<String, AllocationError> {
        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(requested) = requested.filter(|alias| !alias.is_empty()) {
            if taken.insert(requested.to_string()) {
                return Ok(requested.to_string());
            }
            debug!("Requested alias {} is taken, generating one", requested);
        }

        for _ in 0..MAX_ALIAS_ATTEMPTS {
            let candidate = (self.generator)();
            if taken.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }

        Err(AllocationError::NoAliasAvailable {
            attempts: MAX_ALIAS_ATTEMPTS,
        })
    }

    pub fn release(&self, alias: &str) {
        let mut taken = self.taken.lock().unwrap_or_else(|e| e.into_inner());
        taken.remove(alias);
    }
}

impl Default for AliasAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_generated_alias_shape() {
        let alias = generate_alias();
        let parts: Vec<&str> = alias.split('-').collect();

        assert_eq!(parts.len(), 4, "unexpected alias {}", alias);
        assert_eq!(parts[0], "exposed");
        assert!(ADJECTIVES.contains(&parts[1]));
        assert!(ANIMALS.contains(&parts[2]));
        assert_eq!(parts[3].len(), SUFFIX_LEN);
        assert!(parts[3]
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_requested_alias_used_verbatim() {
        let allocator = AliasAllocator::new();
        assert_eq!(allocator.allocate(Some("db")).unwrap(), "db");
    }

    #[test]
    fn test_taken_alias_falls_back_to_generated() {
        let allocator = AliasAllocator::with_generator(|| "generated".to_string());
        assert_eq!(allocator.allocate(Some("db")).unwrap(), "db");
        assert_eq!(allocator.allocate(Some("db")).unwrap(), "generated");
    }

    #[test]
    fn test_empty_request_generates() {
        let allocator = AliasAllocator::with_generator(|| "generated".to_string());
        assert_eq!(allocator.allocate(Some("")).unwrap(), "generated");
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let allocator = AliasAllocator::with_generator(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "same".to_string()
        });

        allocator.allocate(None).unwrap();
        calls.store(0, Ordering::SeqCst);

        assert_eq!(
            allocator.allocate(None),
            Err(AllocationError::NoAliasAvailable {
                attempts: MAX_ALIAS_ATTEMPTS
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ALIAS_ATTEMPTS);
    }

    #[test]
    fn test_release_frees_alias() {
        let allocator = AliasAllocator::new();
        allocator.allocate(Some("web")).unwrap();
        allocator.release("web");
        assert_eq!(allocator.allocate(Some("web")).unwrap(), "web");
    }
}
