use std::collections::{HashMap, HashSet};

/// Names already returned on one directory stream.
#[derive(Debug, Default)]
pub struct Seenset {
    pub dir: u64,
    names: HashSet<String>,
    complete: bool,
}

impl Seenset {
    pub fn new(dir: u64) -> Self {
        Self {
            dir,
            ..Default::default()
        }
    }

    /// Record `name`; false if the stream already produced it.
    pub fn insert(&mut self, name: &str) -> bool {
        if self.names.contains(name) {
            return false;
        }
        self.names.insert(name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The agent delivered its final page.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Rewind to the start of the stream.
    pub fn reset(&mut self) {
        self.names.clear();
        self.complete = false;
    }
}

/// Live seensets keyed by the directory handle given to the kernel.
#[derive(Debug)]
pub struct SeensetRegistry {
    next_fh: u64,
    sets: HashMap<u64, Seenset>,
}

impl SeensetRegistry {
    pub fn new() -> Self {
        Self {
            next_fh: 1,
            sets: HashMap::new(),
        }
    }

    pub fn create(&mut self, dir: u64) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.sets.insert(fh, Seenset::new(dir));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<&Seenset> {
        self.sets.get(&fh)
    }

    pub fn get_mut(&mut self, fh: u64) -> Option<&mut Seenset> {
        self.sets.get_mut(&fh)
    }

    pub fn destroy(&mut self, fh: u64) -> Option<Seenset> {
        self.sets.remove(&fh)
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl Default for SeensetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
