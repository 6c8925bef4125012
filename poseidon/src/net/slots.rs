use crate::socket::AbstractSocket;
use slab::Slab;
use std::sync::Weak;

struct SocketSlot {
    weak: Weak<dyn AbstractSocket>,
    generation: u32,
}

/// Maps 64-bit readiness cookies to socket weak references.
///
/// The cookie is `generation << 32 | slot key`. Slab keys are reused
/// aggressively, so a stale cookie left in the kernel's event queue
/// could otherwise resolve to an unrelated socket; the generation makes
/// every registration distinct.
pub(crate) struct SlotTable {
    slab: Slab<SocketSlot>,
    generation: u32,
}

impl SlotTable {
    pub(crate) fn new() -> Self {
        Self {
            slab: Slab::new(),
            generation: 0,
        }
    }

    pub(crate) fn insert(&mut self, weak: Weak<dyn AbstractSocket>) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let key = self.slab.insert(SocketSlot { weak, generation });
        ((generation as u64) << 32) | key as u64
    }

    pub(crate) fn get(&self, cookie: u64) -> Option<&Weak<dyn AbstractSocket>> {
        let (generation, key) = split(cookie);
        let slot = self.slab.get(key)?;
        (slot.generation == generation).then_some(&slot.weak)
    }

    pub(crate) fn remove(&mut self, cookie: u64) -> bool {
        let (generation, key) = split(cookie);
        match self.slab.get(key) {
            Some(slot) if slot.generation == generation => {
                self.slab.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }
}

fn split(cookie: u64) -> (u32, usize) {
    ((cookie >> 32) as u32, (cookie & 0xFFFF_FFFF) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{ListenSocket, SocketAddress};
    use std::sync::Arc;

    fn listener() -> Arc<dyn AbstractSocket> {
        let addr: SocketAddress = "[::1]:0".parse().unwrap();
        ListenSocket::bind(&addr, |_, _| None).unwrap()
    }

    #[test]
    fn test_cookie_resolves_registered_socket() {
        let mut table = SlotTable::new();
        let sock = listener();
        let cookie = table.insert(Arc::downgrade(&sock));

        assert!(table.get(cookie).unwrap().upgrade().is_some());
        assert_eq!(table.len(), 1);

        assert!(table.remove(cookie));
        assert!(table.get(cookie).is_none());
        assert!(!table.remove(cookie));
    }

    #[test]
    fn test_stale_cookie_does_not_alias_reused_slot() {
        let mut table = SlotTable::new();
        let first = listener();
        let second = listener();

        let old_cookie = table.insert(Arc::downgrade(&first));
        table.remove(old_cookie);

        // The slab reuses key 0; the generation must differ.
        let new_cookie = table.insert(Arc::downgrade(&second));
        assert_ne!(old_cookie, new_cookie);
        assert!(table.get(old_cookie).is_none());
        assert!(table.get(new_cookie).is_some());
    }

    #[test]
    fn test_dead_socket_upgrades_to_none() {
        let mut table = SlotTable::new();
        let sock = listener();
        let cookie = table.insert(Arc::downgrade(&sock));
        drop(sock);

        assert!(table.get(cookie).unwrap().upgrade().is_none());
    }
}
