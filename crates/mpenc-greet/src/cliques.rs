//! CLIQUES tree Diffie-Hellman group key agreement.
//!
//! Each member holds private exponents; an intermediate-key vector
//! accumulates partial products on Curve25519. After an upflow has
//! passed through every member, slot `i` of the vector is the product
//! of all exponents except member `i`'s newest one, so each member
//! recovers the same group key by multiplying its own newest exponent
//! into its own slot.
//!
//! Invariant kept across operations: a member's slot in any broadcast
//! is missing exactly that member's newest exponent. Renewing an
//! exponent first folds the superseded one into the own slot, then
//! multiplies the fresh exponent into every other slot. A join draws
//! nothing: the caller seeds the newcomer's slot with the current
//! cardinal, and only the joining members contribute fresh exponents.

use mpenc_crypto::x25519::{DhElement, DhSecret};

use crate::{check_no_duplicates, Flow, GreetError, Result};

/// A CLIQUES sub-message exchanged within a greeting.
#[derive(Debug, Clone)]
pub struct CliquesMessage {
    pub source: String,
    /// Empty string means broadcast.
    pub dest: String,
    pub flow: Flow,
    pub members: Vec<String>,
    pub int_keys: Vec<DhElement>,
}

/// Per-participant CLIQUES state.
#[derive(Debug, Clone)]
pub struct CliquesMember {
    id: String,
    members: Vec<String>,
    int_keys: Vec<DhElement>,
    priv_key_list: Vec<DhSecret>,
    group_key: Option<DhElement>,
}

impl CliquesMember {
    /// A fresh member with no session.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            int_keys: Vec::new(),
            priv_key_list: Vec::new(),
            group_key: None,
        }
    }

    /// Resume from a completed session snapshot.
    pub fn resume(
        id: impl Into<String>,
        members: Vec<String>,
        int_keys: Vec<DhElement>,
        priv_key_list: Vec<DhSecret>,
        group_key: DhElement,
    ) -> Self {
        Self {
            id: id.into(),
            members,
            int_keys,
            priv_key_list,
            group_key: Some(group_key),
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn int_keys(&self) -> &[DhElement] {
        &self.int_keys
    }

    pub fn priv_key_list(&self) -> &[DhSecret] {
        &self.priv_key_list
    }

    pub fn group_key(&self) -> Option<&DhElement> {
        self.group_key.as_ref()
    }

    fn my_pos(&self) -> Result<usize> {
        self.members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| GreetError::Malformed(format!("{} not in member list", self.id)))
    }

    /// Replace the own exponent and return the new cardinal key.
    ///
    /// Only for the operations that pick fresh randomness: the upflow
    /// contribution, exclude and refresh. A join reuses the caller's
    /// exponent (see [`CliquesMember::aka_join`]). The superseded
    /// exponent is folded into the own slot first, so the own slot
    /// keeps missing exactly the newest exponent.
    fn renew_key(&mut self) -> Result<DhElement> {
        let my_pos = self.my_pos()?;
        if self.int_keys.is_empty() {
            return Err(GreetError::Malformed("no intermediate keys to renew".into()));
        }
        if let Some(previous) = self.priv_key_list.last() {
            self.int_keys[my_pos] = previous.mult(&self.int_keys[my_pos]);
        }

        let fresh = DhSecret::generate();
        for (i, int_key) in self.int_keys.iter_mut().enumerate() {
            if i != my_pos {
                *int_key = fresh.mult(int_key);
            }
        }
        let cardinal = fresh.mult(&self.int_keys[my_pos]);
        self.priv_key_list.push(fresh);
        Ok(cardinal)
    }

    /// Contribute the own exponent and route the chain onward: forward
    /// the upflow to the next member, or finish with a broadcast when
    /// this member is the last in the list.
    fn advance_chain(&mut self) -> Result<CliquesMessage> {
        let my_pos = self.my_pos()?;
        let cardinal = self.renew_key()?;

        if my_pos == self.members.len() - 1 {
            self.group_key = Some(cardinal);
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: String::new(),
                flow: Flow::Down,
                members: self.members.clone(),
                int_keys: self.int_keys.clone(),
            })
        } else {
            self.int_keys.push(cardinal);
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: self.members[my_pos + 1].clone(),
                flow: Flow::Up,
                members: self.members.clone(),
                int_keys: self.int_keys.clone(),
            })
        }
    }

    /// Start the initial key agreement with the given other members.
    pub fn ika(&mut self, others: &[String]) -> Result<CliquesMessage> {
        if others.is_empty() {
            return Err(GreetError::IllegalCaller(
                "initial key agreement needs at least one other member".into(),
            ));
        }
        let mut members = vec![self.id.clone()];
        members.extend_from_slice(others);
        check_no_duplicates(&members)?;

        self.members = members;
        self.int_keys = vec![DhElement::base()];
        self.priv_key_list.clear();
        self.group_key = None;
        self.advance_chain()
    }

    /// Process an upflow addressed to this member.
    pub fn upflow(&mut self, message: &CliquesMessage) -> Result<CliquesMessage> {
        check_no_duplicates(&message.members)?;
        let my_pos = message
            .members
            .iter()
            .position(|m| *m == self.id)
            .ok_or_else(|| GreetError::Malformed("upflow member list omits self".into()))?;
        if message.int_keys.len() != my_pos + 1 {
            return Err(GreetError::Malformed(format!(
                "upflow carries {} intermediate keys at chain position {}",
                message.int_keys.len(),
                my_pos
            )));
        }

        self.members = message.members.clone();
        self.int_keys = message.int_keys.clone();
        self.group_key = None;
        self.advance_chain()
    }

    /// Process a downflow broadcast and derive the group key.
    pub fn downflow(&mut self, message: &CliquesMessage) -> Result<()> {
        check_no_duplicates(&message.members)?;
        if message.int_keys.len() != message.members.len() {
            return Err(GreetError::Malformed(format!(
                "downflow carries {} intermediate keys for {} members",
                message.int_keys.len(),
                message.members.len()
            )));
        }
        if !message.members.contains(&self.id) {
            return Err(GreetError::Malformed("downflow member list omits self".into()));
        }
        let own_key = self
            .priv_key_list
            .last()
            .ok_or_else(|| GreetError::Malformed("no own exponent to derive group key".into()))?;

        self.members = message.members.clone();
        self.int_keys = message.int_keys.clone();
        let my_pos = self.my_pos()?;
        self.group_key = Some(own_key.mult(&self.int_keys[my_pos]));
        Ok(())
    }

    /// Extend the member list and hand the chain to the first newcomer.
    ///
    /// The caller reuses its existing exponent: the newcomer's starting
    /// slot is the current cardinal (the own exponent multiplied into
    /// the own slot). Fresh randomness enters only through the new
    /// members' own upflow contributions.
    pub fn aka_join(&mut self, new_members: &[String]) -> Result<CliquesMessage> {
        if new_members.is_empty() {
            return Err(GreetError::IllegalCaller("no members to include".into()));
        }
        let first_new = self.members.len();
        let mut members = self.members.clone();
        members.extend_from_slice(new_members);
        check_no_duplicates(&members)?;

        let my_pos = self.my_pos()?;
        let own_key = self
            .priv_key_list
            .last()
            .ok_or_else(|| GreetError::IllegalCaller("no established chain to extend".into()))?;
        let own_slot = self
            .int_keys
            .get(my_pos)
            .ok_or_else(|| GreetError::Malformed("no intermediate key for own slot".into()))?;
        let cardinal = own_key.mult(own_slot);

        self.members = members;
        self.int_keys.push(cardinal);

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: self.members[first_new].clone(),
            flow: Flow::Up,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Drop members, refresh the own contribution and rebroadcast.
    pub fn aka_exclude(&mut self, exclude: &[String]) -> Result<CliquesMessage> {
        if exclude.is_empty() {
            return Err(GreetError::IllegalCaller("no members to exclude".into()));
        }
        if exclude.contains(&self.id) {
            return Err(GreetError::IllegalCaller("cannot exclude self".into()));
        }
        if let Some(missing) = exclude.iter().find(|m| !self.members.contains(m)) {
            return Err(GreetError::IllegalCaller(format!(
                "cannot exclude non-member {missing}"
            )));
        }

        let mut members = Vec::with_capacity(self.members.len());
        let mut int_keys = Vec::with_capacity(self.int_keys.len());
        for (member, int_key) in self.members.iter().zip(&self.int_keys) {
            if !exclude.contains(member) {
                members.push(member.clone());
                int_keys.push(int_key.clone());
            }
        }
        self.members = members;
        self.int_keys = int_keys;

        let cardinal = self.renew_key()?;
        self.group_key = Some(cardinal);

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Refresh the own exponent and rebroadcast; members unchanged.
    pub fn aka_refresh(&mut self) -> Result<CliquesMessage> {
        let cardinal = self.renew_key()?;
        self.group_key = Some(cardinal);

        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Destroy the own secret exponents and the derived key.
    pub fn aka_quit(&mut self) {
        self.priv_key_list.clear();
        self.int_keys.clear();
        self.group_key = None;
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Drive an upflow started by `message` through the remaining
    /// members, then deliver the closing downflow to everyone.
    fn drain(start: CliquesMessage, members: &mut [&mut CliquesMember]) -> CliquesMessage {
        let mut message = start;
        while message.flow == Flow::Up {
            let next = members
                .iter_mut()
                .find(|m| m.id == message.dest)
                .expect("dest member");
            message = next.upflow(&message).expect("upflow");
        }
        for member in members.iter_mut() {
            if member.id != message.source && member.members().contains(&member.id) {
                member.downflow(&message).expect("downflow");
            }
        }
        message
    }

    #[test]
    fn test_ika_three_members_agree() {
        let mut m1 = CliquesMember::new("1");
        let mut m2 = CliquesMember::new("2");
        let mut m3 = CliquesMember::new("3");

        let start = m1.ika(&ids(&["2", "3"])).expect("ika");
        assert_eq!(start.dest, "2");
        assert_eq!(start.int_keys.len(), 2);

        let down = drain(start, &mut [&mut m1, &mut m2, &mut m3]);
        assert_eq!(down.flow, Flow::Down);
        assert_eq!(down.int_keys.len(), 3);

        let key = m1.group_key().expect("key 1");
        assert_eq!(Some(key), m2.group_key());
        assert_eq!(Some(key), m3.group_key());
    }

    #[test]
    fn test_ika_requires_others() {
        let mut m1 = CliquesMember::new("1");
        assert!(m1.ika(&[]).is_err());
    }

    #[test]
    fn test_upflow_rejects_duplicates() {
        let mut m2 = CliquesMember::new("2");
        let mut m1 = CliquesMember::new("1");
        let mut start = m1.ika(&ids(&["2", "3"])).expect("ika");
        start.members = ids(&["1", "2", "2"]);
        assert!(m2.upflow(&start).is_err());
    }

    #[test]
    fn test_upflow_wrong_position_rejected() {
        let mut m1 = CliquesMember::new("1");
        let mut m3 = CliquesMember::new("3");
        // The initial upflow is addressed to member 2; member 3 must
        // refuse to treat it as its own chain position.
        let start = m1.ika(&ids(&["2", "3"])).expect("ika");
        assert!(m3.upflow(&start).is_err());
    }

    #[test]
    fn test_join_extends_group() {
        let mut m1 = CliquesMember::new("1");
        let mut m2 = CliquesMember::new("2");
        let start = m1.ika(&ids(&["2"])).expect("ika");
        drain(start, &mut [&mut m1, &mut m2]);
        let old_key = m1.group_key().expect("old key").clone();

        let mut m3 = CliquesMember::new("3");
        let join = m1.aka_join(&ids(&["3"])).expect("join");
        assert_eq!(join.dest, "3");
        assert_eq!(join.members, ids(&["1", "2", "3"]));
        // The newcomer's starting slot is the previous cardinal; the
        // caller contributes no fresh exponent.
        assert_eq!(join.int_keys.last(), Some(&old_key));
        assert_eq!(m1.priv_key_list().len(), 1);

        drain(join, &mut [&mut m1, &mut m2, &mut m3]);
        let key = m1.group_key().expect("key");
        assert_eq!(Some(key), m2.group_key());
        assert_eq!(Some(key), m3.group_key());
        assert_ne!(key, &old_key);
        assert_eq!(m1.priv_key_list().len(), 1);
        assert_eq!(m3.priv_key_list().len(), 1);
    }

    #[test]
    fn test_exclude_shrinks_group() {
        let mut m1 = CliquesMember::new("1");
        let mut m2 = CliquesMember::new("2");
        let mut m3 = CliquesMember::new("3");
        let start = m1.ika(&ids(&["2", "3"])).expect("ika");
        drain(start, &mut [&mut m1, &mut m2, &mut m3]);
        let old_key = m1.group_key().expect("old key").clone();

        let down = m1.aka_exclude(&ids(&["2"])).expect("exclude");
        assert_eq!(down.members, ids(&["1", "3"]));
        assert_eq!(down.int_keys.len(), 2);
        m3.downflow(&down).expect("downflow");

        let key = m1.group_key().expect("key");
        assert_eq!(Some(key), m3.group_key());
        assert_ne!(key, &old_key);
    }

    #[test]
    fn test_exclude_self_rejected() {
        let mut m1 = CliquesMember::new("1");
        let mut m2 = CliquesMember::new("2");
        let start = m1.ika(&ids(&["2"])).expect("ika");
        drain(start, &mut [&mut m1, &mut m2]);
        assert!(m1.aka_exclude(&ids(&["1"])).is_err());
    }

    #[test]
    fn test_refresh_changes_key_keeps_members() {
        let mut m1 = CliquesMember::new("1");
        let mut m2 = CliquesMember::new("2");
        let start = m1.ika(&ids(&["2"])).expect("ika");
        drain(start, &mut [&mut m1, &mut m2]);
        let old_key = m1.group_key().expect("old key").clone();

        let down = m1.aka_refresh().expect("refresh");
        assert_eq!(down.members, ids(&["1", "2"]));
        m2.downflow(&down).expect("downflow");

        let key = m1.group_key().expect("key");
        assert_eq!(Some(key), m2.group_key());
        assert_ne!(key, &old_key);
    }

    #[test]
    fn test_repeated_operations_stay_consistent() {
        let mut m1 = CliquesMember::new("1");
        let mut m2 = CliquesMember::new("2");
        let mut m3 = CliquesMember::new("3");
        let mut m4 = CliquesMember::new("4");

        let start = m1.ika(&ids(&["2", "3"])).expect("ika");
        drain(start, &mut [&mut m1, &mut m2, &mut m3]);

        let join = m2.aka_join(&ids(&["4"])).expect("join");
        drain(join, &mut [&mut m1, &mut m2, &mut m3, &mut m4]);
        let key = m1.group_key().expect("key").clone();
        assert_eq!(Some(&key), m2.group_key());
        assert_eq!(Some(&key), m3.group_key());
        assert_eq!(Some(&key), m4.group_key());

        let down = m3.aka_exclude(&ids(&["1"])).expect("exclude");
        m2.downflow(&down).expect("downflow");
        m4.downflow(&down).expect("downflow");
        let key = m3.group_key().expect("key").clone();
        assert_eq!(Some(&key), m2.group_key());
        assert_eq!(Some(&key), m4.group_key());

        let down = m4.aka_refresh().expect("refresh");
        m2.downflow(&down).expect("downflow");
        m3.downflow(&down).expect("downflow");
        let key = m4.group_key().expect("key").clone();
        assert_eq!(Some(&key), m2.group_key());
        assert_eq!(Some(&key), m3.group_key());
    }

    #[test]
    fn test_quit_destroys_secrets() {
        let mut m1 = CliquesMember::new("1");
        let mut m2 = CliquesMember::new("2");
        let start = m1.ika(&ids(&["2"])).expect("ika");
        drain(start, &mut [&mut m1, &mut m2]);

        m1.aka_quit();
        assert!(m1.priv_key_list().is_empty());
        assert!(m1.group_key().is_none());
    }
}
