//! Live-object registry.
//!
//! An arena of object slots addressed by [`ObjectId`]. Keyed objects are
//! indexed by (hierarchy root, key), so a lookup through any class of the
//! hierarchy finds the one live instance. Under evictable retention a clean
//! object's slot may be emptied; its handle stays valid and the transaction
//! rematerializes it by key on next access.

use std::collections::HashMap;

use sqlobject_core::{Error, Result, Tuple};

use crate::object::{DataObject, ObjectId};

#[derive(Debug)]
pub(crate) enum Slot {
    Resident(Box<DataObject>),
    /// Dropped under evictable retention; reloaded by key
    Evicted { class: String, key: Tuple },
    /// Deleted or rolled back; the handle is dead
    Discarded,
}

#[derive(Debug)]
pub(crate) struct Registry {
    txn: u64,
    slots: Vec<Slot>,
    index: HashMap<(String, Tuple), usize>,
    clock: u64,
    resident: usize,
}

impl Registry {
    pub(crate) fn new(txn: u64) -> Self {
        Self {
            txn,
            slots: Vec::new(),
            index: HashMap::new(),
            clock: 0,
            resident: 0,
        }
    }

    pub(crate) fn insert(&mut self, mut object: DataObject) -> ObjectId {
        self.clock += 1;
        object.last_access = self.clock;
        self.slots.push(Slot::Resident(Box::new(object)));
        self.resident += 1;
        ObjectId {
            txn: self.txn,
            index: self.slots.len() - 1,
        }
    }

    fn check(&self, id: ObjectId) -> Result<usize> {
        if id.txn != self.txn || id.index >= self.slots.len() {
            return Err(Error::concurrent(
                "",
                format!("object handle {id} does not belong to this transaction"),
            ));
        }
        Ok(id.index)
    }

    pub(crate) fn slot(&self, id: ObjectId) -> Result<&Slot> {
        let index = self.check(id)?;
        Ok(&self.slots[index])
    }

    /// Resident object; evicted or discarded slots are errors here.
    pub(crate) fn get(&self, id: ObjectId) -> Result<&DataObject> {
        match self.slot(id)? {
            Slot::Resident(obj) => Ok(&**obj),
            Slot::Evicted { class, .. } => Err(Error::concurrent(
                class.clone(),
                format!("object {id} is not resident"),
            )),
            Slot::Discarded => Err(Error::concurrent("", format!("object {id} was discarded"))),
        }
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Result<&mut DataObject> {
        let index = self.check(id)?;
        self.clock += 1;
        let clock = self.clock;
        match &mut self.slots[index] {
            Slot::Resident(obj) => {
                obj.last_access = clock;
                Ok(&mut **obj)
            }
            Slot::Evicted { class, .. } => Err(Error::concurrent(
                class.clone(),
                format!("object {id} is not resident"),
            )),
            Slot::Discarded => Err(Error::concurrent("", format!("object {id} was discarded"))),
        }
    }

    /// Resident object, if any.
    pub(crate) fn try_get(&self, id: ObjectId) -> Option<&DataObject> {
        match self.slots.get(id.index) {
            Some(Slot::Resident(obj)) if id.txn == self.txn => Some(&**obj),
            _ => None,
        }
    }

    pub(crate) fn lookup(&self, root: &str, key: &Tuple) -> Option<ObjectId> {
        self.index
            .get(&(root.to_string(), key.clone()))
            .map(|&index| ObjectId {
                txn: self.txn,
                index,
            })
    }

    /// Index `id` under (root, key).
    ///
    /// A different live object already holding the key is a conflict.
    pub(crate) fn register_key(&mut self, root: &str, key: &Tuple, id: ObjectId) -> Result<()> {
        let index = self.check(id)?;
        match self.index.get(&(root.to_string(), key.clone())) {
            Some(&existing) if existing != index => Err(Error::concurrent(
                root,
                format!("another object with key {key} is already registered"),
            )),
            _ => {
                self.index.insert((root.to_string(), key.clone()), index);
                Ok(())
            }
        }
    }

    pub(crate) fn unregister_key(&mut self, root: &str, key: &Tuple) {
        self.index.remove(&(root.to_string(), key.clone()));
    }

    /// Put a rematerialized object back into an evicted slot.
    pub(crate) fn restore(&mut self, id: ObjectId, mut object: DataObject) -> Result<()> {
        let index = self.check(id)?;
        self.clock += 1;
        object.last_access = self.clock;
        if !matches!(self.slots[index], Slot::Resident(_)) {
            self.resident += 1;
        }
        self.slots[index] = Slot::Resident(Box::new(object));
        Ok(())
    }

    pub(crate) fn evict(&mut self, id: ObjectId) -> Result<()> {
        let index = self.check(id)?;
        let evicted = match &self.slots[index] {
            Slot::Resident(obj) => match &obj.key {
                Some(key) => Slot::Evicted {
                    class: obj.class.clone(),
                    key: key.clone(),
                },
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        self.slots[index] = evicted;
        self.resident -= 1;
        Ok(())
    }

    /// Kill the handle and free the key.
    pub(crate) fn discard(&mut self, id: ObjectId, root: &str) -> Result<()> {
        let index = self.check(id)?;
        let key = match &self.slots[index] {
            Slot::Resident(obj) => {
                self.resident -= 1;
                obj.key.clone()
            }
            Slot::Evicted { key, .. } => Some(key.clone()),
            Slot::Discarded => None,
        };
        if let Some(key) = key {
            if self.lookup(root, &key) == Some(id) {
                self.unregister_key(root, &key);
            }
        }
        self.slots[index] = Slot::Discarded;
        Ok(())
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.resident
    }

    /// Handles of every resident object, in creation order.
    pub(crate) fn resident_ids(&self) -> Vec<ObjectId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Resident(_)))
            .map(|(index, _)| ObjectId {
                txn: self.txn,
                index,
            })
            .collect()
    }

    /// Every resident object, without touching access times.
    pub(crate) fn resident_mut(&mut self) -> impl Iterator<Item = &mut DataObject> + '_ {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Resident(obj) => Some(&mut **obj),
            _ => None,
        })
    }

    /// Resident objects ordered least recently used first.
    pub(crate) fn by_last_access(&self) -> Vec<ObjectId> {
        let mut ids: Vec<(u64, ObjectId)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Resident(obj) => Some((
                    obj.last_access,
                    ObjectId {
                        txn: self.txn,
                        index,
                    },
                )),
                _ => None,
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(key: i64) -> DataObject {
        DataObject::for_update("Person", Tuple::from(key), 2, true)
    }

    #[test]
    fn one_live_object_per_key() {
        let mut registry = Registry::new(1);
        let a = registry.insert(object(1));
        registry.register_key("Person", &Tuple::from(1i64), a).unwrap();
        let b = registry.insert(object(1));
        let err = registry
            .register_key("Person", &Tuple::from(1i64), b)
            .unwrap_err();
        assert_eq!(err.kind(), sqlobject_core::ErrorKind::ConcurrentMutation);
        assert_eq!(registry.lookup("Person", &Tuple::from(1i64)), Some(a));
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut mine = Registry::new(1);
        let mut other = Registry::new(2);
        let id = other.insert(object(1));
        mine.insert(object(1));
        assert!(mine.get(id).is_err());
    }

    #[test]
    fn evict_keeps_handle_and_key() {
        let mut registry = Registry::new(1);
        let id = registry.insert(object(5));
        registry.register_key("Person", &Tuple::from(5i64), id).unwrap();
        registry.evict(id).unwrap();
        assert_eq!(registry.resident_count(), 0);
        assert!(matches!(registry.slot(id).unwrap(), Slot::Evicted { .. }));
        assert_eq!(registry.lookup("Person", &Tuple::from(5i64)), Some(id));

        registry.restore(id, object(5)).unwrap();
        assert_eq!(registry.resident_count(), 1);
        assert!(registry.get(id).is_ok());
    }

    #[test]
    fn lru_order_follows_access() {
        let mut registry = Registry::new(1);
        let a = registry.insert(object(1));
        let b = registry.insert(object(2));
        registry.get_mut(a).unwrap();
        assert_eq!(registry.by_last_access(), vec![b, a]);

        registry.discard(b, "Person").unwrap();
        assert_eq!(registry.resident_ids(), vec![a]);
    }
}
