//! Voice handles and voice groups
//!
//! A handle is a generation-checked reference to a voice slot: the low 12
//! bits carry `slot + 1`, the high 20 bits carry the play counter at the
//! time the voice was started. A stale handle (the slot was reused) fails
//! the generation check and every operation on it becomes a no-op.
//!
//! Group handles live in a reserved range (`0xFFFF_F000 | group_index`)
//! that voice handles can never produce because the play counter wraps
//! before reaching 20 set bits.

/// Bit pattern marking a group handle
const GROUP_HANDLE_BASE: u32 = 0xFFFF_F000;

/// The play counter wraps before this value so voice handles never
/// collide with group handles
pub(crate) const MAX_PLAY_INDEX: u32 = 0xF_FFFF;

/// Maximum number of voice groups
const MAX_GROUPS: usize = 0xFFF;

/// Reference to a playing voice or a voice group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u32);

impl Handle {
    /// The root output bus; `play_ex` routes here by default
    pub const PRIMARY: Handle = Handle(0);

    /// Raw handle value, for hosts that persist handles across FFI
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstruct a handle from its raw value
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Whether this handle refers to a voice group
    #[inline]
    pub fn is_group(self) -> bool {
        self.0 & GROUP_HANDLE_BASE == GROUP_HANDLE_BASE
    }

    pub(crate) fn from_slot(slot: usize, play_index: u32) -> Self {
        debug_assert!(play_index < MAX_PLAY_INDEX);
        Self((slot as u32 + 1) | (play_index << 12))
    }

    /// Voice slot index, if this is a voice handle
    pub(crate) fn slot(self) -> Option<usize> {
        if self.is_group() {
            return None;
        }
        let low = self.0 & 0xFFF;
        if low == 0 {
            None
        } else {
            Some((low - 1) as usize)
        }
    }

    /// Play counter captured when the voice started
    pub(crate) fn play_index(self) -> u32 {
        self.0 >> 12
    }

    /// Group table index, if this is a group handle
    pub(crate) fn group_index(self) -> Option<usize> {
        self.is_group().then_some((self.0 & 0xFFF) as usize)
    }
}

/// Table of voice groups.
///
/// Members are stored as raw handles; dead handles are trimmed lazily
/// whenever a group is resolved, so stopping a voice never has to search
/// the group table.
#[derive(Debug, Default)]
pub(crate) struct VoiceGroups {
    groups: Vec<Option<Vec<Handle>>>,
}

impl VoiceGroups {
    /// Create a new, empty group and return its handle
    pub fn create(&mut self) -> Option<Handle> {
        let index = match self.groups.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                if self.groups.len() >= MAX_GROUPS {
                    return None;
                }
                self.groups.push(None);
                self.groups.len() - 1
            }
        };
        self.groups[index] = Some(Vec::new());
        Some(Handle(GROUP_HANDLE_BASE | index as u32))
    }

    /// Destroy a group (its member voices keep playing)
    pub fn destroy(&mut self, handle: Handle) -> bool {
        match handle.group_index() {
            Some(i) if i < self.groups.len() => self.groups[i].take().is_some(),
            _ => false,
        }
    }

    pub fn exists(&self, handle: Handle) -> bool {
        handle
            .group_index()
            .is_some_and(|i| i < self.groups.len() && self.groups[i].is_some())
    }

    /// Add a voice handle to a group; duplicates are ignored
    pub fn add(&mut self, group: Handle, voice: Handle) -> bool {
        let Some(i) = group.group_index() else {
            return false;
        };
        match self.groups.get_mut(i).and_then(Option::as_mut) {
            Some(members) => {
                if !members.contains(&voice) {
                    members.push(voice);
                }
                true
            }
            None => false,
        }
    }

    /// Resolve group members, first dropping handles `is_live` rejects
    pub fn members_trimmed(
        &mut self,
        group: Handle,
        is_live: impl Fn(Handle) -> bool,
    ) -> Option<&[Handle]> {
        let i = group.group_index()?;
        let members = self.groups.get_mut(i)?.as_mut()?;
        members.retain(|&h| is_live(h));
        Some(members.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_handle_roundtrip() {
        let h = Handle::from_slot(17, 42);
        assert_eq!(h.slot(), Some(17));
        assert_eq!(h.play_index(), 42);
        assert!(!h.is_group());
    }

    #[test]
    fn test_primary_is_not_a_voice_or_group() {
        assert_eq!(Handle::PRIMARY.slot(), None);
        assert!(!Handle::PRIMARY.is_group());
    }

    #[test]
    fn test_highest_play_index_stays_out_of_group_range() {
        let h = Handle::from_slot(1023, MAX_PLAY_INDEX - 1);
        assert!(!h.is_group());
        assert_eq!(h.slot(), Some(1023));
    }

    #[test]
    fn test_group_lifecycle() {
        let mut groups = VoiceGroups::default();
        let g = groups.create().unwrap();
        assert!(g.is_group());
        assert!(groups.exists(g));

        let v1 = Handle::from_slot(0, 1);
        let v2 = Handle::from_slot(1, 2);
        assert!(groups.add(g, v1));
        assert!(groups.add(g, v2));
        assert!(groups.add(g, v1)); // duplicate ignored

        let members = groups.members_trimmed(g, |_| true).unwrap();
        assert_eq!(members, &[v1, v2]);

        // Trim drops dead members
        let members = groups.members_trimmed(g, |h| h == v2).unwrap();
        assert_eq!(members, &[v2]);

        assert!(groups.destroy(g));
        assert!(!groups.exists(g));
        assert!(!groups.add(g, v1));
    }
}
