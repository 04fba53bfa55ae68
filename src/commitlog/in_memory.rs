use crate::commitlog::{Index, Log};
use std::collections::VecDeque;
use std::io;

// Entries are held in RAM. Durability at rest is left to a disk-backed `Log` impl.
pub struct InMemoryLog<E> {
    log: VecDeque<E>,
    // Index of `log[0]`.
    first_index: Index,
}

impl<E> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: VecDeque::new(),
            first_index: Index::start_index(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some((index.as_u64() - self.first_index.as_u64()) as usize)
        }
    }
}

impl<E: Clone> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        self.log.push_back(entry);

        Ok(self.first_index.plus(self.log.len() as u64 - 1))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        Ok(self.vec_index(index).and_then(|i| self.log.get(i)).cloned())
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        match self.vec_index(index) {
            Some(vec_index) => self.log.truncate(vec_index),
            None => self.log.clear(),
        }
        Ok(())
    }

    fn compact(&mut self, index: Index) -> Result<(), io::Error> {
        if index < self.first_index {
            return Ok(());
        }
        let num_to_drop = self.first_index.distance_to(index.plus(1)) as usize;
        if num_to_drop >= self.log.len() {
            self.log.clear();
        } else {
            self.log.drain(..num_to_drop);
        }
        self.first_index = index.plus(1);
        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.log.clear();
        self.first_index = next_index;
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }
}
