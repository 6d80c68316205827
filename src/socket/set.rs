use core::fmt;

use heapless::Vec;
use serde::{Deserialize, Serialize};

use super::Socket;
use crate::error::SocketError;

/// A handle, identifying a socket in a set.
///
/// `link` is the modem's link number, which doubles as the slot index.
/// `generation` changes every time the slot is reused, so a handle kept past
/// its socket's release never reaches the next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle {
    pub link: u8,
    pub generation: u8,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.link)
    }
}

struct Slot<'a> {
    generation: u8,
    socket: Option<Socket<'a>>,
}

/// Fixed table of sockets indexed by link number.
///
/// A slot is occupied while its socket is open, opening, or waiting to
/// reconnect. Released sockets queue up until the caller takes them back
/// with [`reclaim`](Set::reclaim), which hands back their receive storage.
pub struct Set<'a, const N: usize> {
    slots: [Slot<'a>; N],
    reclaim: Vec<Socket<'a>, N>,
}

impl<'a, const N: usize> Default for Set<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> Set<'a, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                socket: None,
            }),
            reclaim: Vec::new(),
        }
    }

    /// Put `socket` in its pinned slot if that one is free, else in the
    /// first free slot. A full table hands the socket back.
    pub fn insert(&mut self, mut socket: Socket<'a>) -> Result<Handle, (SocketError, Socket<'a>)> {
        let pinned = socket
            .link
            .map(usize::from)
            .filter(|&link| link < N && self.slots[link].socket.is_none());
        let Some(link) = pinned.or_else(|| self.slots.iter().position(|slot| slot.socket.is_none())) else {
            return Err((SocketError::SetFull, socket));
        };

        let slot = &mut self.slots[link];
        slot.generation = slot.generation.wrapping_add(1);
        // link < N <= MAX_NUM_OF_SOCKET, fits in u8
        socket.link = Some(link as u8);
        slot.socket = Some(socket);
        Ok(Handle {
            link: link as u8,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<'a>> {
        self.slots
            .get(usize::from(handle.link))
            .filter(|slot| slot.generation == handle.generation)
    }

    pub fn get(&self, handle: Handle) -> Result<&Socket<'a>, SocketError> {
        self.slot(handle)
            .and_then(|slot| slot.socket.as_ref())
            .ok_or(SocketError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut Socket<'a>, SocketError> {
        self.slots
            .get_mut(usize::from(handle.link))
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.socket.as_mut())
            .ok_or(SocketError::InvalidHandle)
    }

    /// The socket the modem knows as `link`, if any.
    pub fn by_link_mut(&mut self, link: u8) -> Option<(Handle, &mut Socket<'a>)> {
        let slot = self.slots.get_mut(usize::from(link))?;
        let handle = Handle {
            link,
            generation: slot.generation,
        };
        slot.socket.as_mut().map(|socket| (handle, socket))
    }

    /// Take the socket out of the table.
    pub fn remove(&mut self, handle: Handle) -> Result<Socket<'a>, SocketError> {
        self.slots
            .get_mut(usize::from(handle.link))
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.socket.take())
            .map(|mut socket| {
                socket.link = None;
                socket
            })
            .ok_or(SocketError::InvalidHandle)
    }

    /// Free the slot and queue the socket for [`reclaim`](Self::reclaim).
    pub fn release(&mut self, handle: Handle) -> Result<(), SocketError> {
        let socket = self.remove(handle)?;
        self.push_reclaim(socket);
        Ok(())
    }

    pub fn push_reclaim(&mut self, socket: Socket<'a>) {
        if self.reclaim.push(socket).is_err() {
            warn!("[SOCK] reclaim queue full, socket dropped");
        }
    }

    pub fn reclaim(&mut self) -> Option<Socket<'a>> {
        self.reclaim.pop()
    }

    /// Handles of every occupied slot, in link order.
    pub fn handles(&self) -> Vec<Handle, N> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.socket.is_some())
            .map(|(link, slot)| Handle {
                link: link as u8,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.socket.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::RingBuffer;
    use crate::socket::SocketKind;

    fn socket(storage: &mut [u8]) -> Socket<'_> {
        Socket::new(SocketKind::Tcp, "example.com", 80, RingBuffer::new(storage))
    }

    #[test]
    fn fills_first_free_slot_and_refuses_when_full() {
        let mut storage = [[0u8; 4]; 3];
        let [a, b, c] = &mut storage;
        let mut set = Set::<2>::new();

        let first = set.insert(socket(a)).unwrap();
        let second = set.insert(socket(b)).unwrap();
        assert_eq!((first.link, second.link), (0, 1));

        let (err, _socket) = set.insert(socket(c)).err().unwrap();
        assert_eq!(err, SocketError::SetFull);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn pinned_link_is_honoured_when_free() {
        let mut storage = [[0u8; 4]; 2];
        let [a, b] = &mut storage;
        let mut set = Set::<4>::new();

        let pinned = set.insert(socket(a).with_link(2)).unwrap();
        assert_eq!(pinned.link, 2);

        // link 2 is taken, fall back to the first free one
        let other = set.insert(socket(b).with_link(2)).unwrap();
        assert_eq!(other.link, 0);
        assert_eq!(set.get(pinned).unwrap().link(), Some(2));
    }

    #[test]
    fn stale_handle_misses_next_occupant() {
        let mut storage = [[0u8; 4]; 2];
        let [a, b] = &mut storage;
        let mut set = Set::<1>::new();

        let old = set.insert(socket(a)).unwrap();
        set.release(old).unwrap();
        assert_eq!(set.get(old).err(), Some(SocketError::InvalidHandle));

        let new = set.insert(socket(b)).unwrap();
        assert_eq!(new.link, old.link);
        assert!(set.get(new).is_ok());
        assert_eq!(set.get_mut(old).err(), Some(SocketError::InvalidHandle));
        assert_eq!(set.release(old), Err(SocketError::InvalidHandle));
    }

    #[test]
    fn released_socket_can_be_reclaimed() {
        let mut storage = [0u8; 4];
        let mut set = Set::<1>::new();

        let handle = set.insert(socket(&mut storage)).unwrap();
        set.release(handle).unwrap();
        assert!(set.is_empty());

        let socket = set.reclaim().unwrap();
        assert_eq!(socket.link(), None);
        assert_eq!(socket.into_buffer().capacity(), 4);
        assert!(set.reclaim().is_none());
    }

    #[test]
    fn occupied_slots_never_exceed_capacity() {
        let mut storage = [[0u8; 2]; 8];
        let mut set = Set::<3>::new();

        for (i, buf) in storage.iter_mut().enumerate() {
            let result = set.insert(socket(buf));
            assert!(set.len() <= 3);
            if i % 2 == 1 {
                if let Ok(handle) = result {
                    set.release(handle).unwrap();
                }
            }
        }

        let handles = set.handles();
        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                assert_ne!(a.link, b.link);
            }
        }
    }
}
