//! Mapping from absolute flash address to the binary programmed there.
//!
//! Entries keep insertion order, since that is how packages describe them. Devices that need
//! ascending programming order use [`PartitionMap::ascending`].

use std::fmt;

/// A named binary blob destined for one flash address.
#[derive(Clone, PartialEq, Eq)]
pub struct PartitionImage {
    name: Box<str>,
    data: Vec<u8>,
}

impl PartitionImage {
    pub fn new(name: impl Into<Box<str>>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// File name the image was loaded from. Used by size-variant checks.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for PartitionImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionImage")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMap {
    entries: Vec<(u32, PartitionImage)>,
}

impl PartitionMap {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add an image. An image already mapped at the same address is replaced in place and
    /// returned.
    pub fn insert(&mut self, address: u32, image: PartitionImage) -> Option<PartitionImage> {
        match self.entries.iter_mut().find(|(a, _)| *a == address) {
            Some((_, old)) => Some(std::mem::replace(old, image)),
            None => {
                self.entries.push((address, image));
                None
            }
        }
    }

    pub fn get(&self, address: u32) -> Option<&PartitionImage> {
        self.entries
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, img)| img)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &PartitionImage)> {
        self.entries.iter().map(|(a, img)| (*a, img))
    }

    /// Entries sorted by ascending address.
    pub fn ascending(&self) -> Vec<(u32, &PartitionImage)> {
        let mut temp: Vec<_> = self.iter().collect();
        temp.sort_by_key(|(a, _)| *a);
        temp
    }

    /// Sum of all image lengths in bytes.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|(_, img)| img.len() as u64).sum()
    }

    /// Returns the first pair of addresses whose images overlap, if any.
    pub fn first_overlap(&self) -> Option<(u32, u32)> {
        self.ascending().windows(2).find_map(|w| {
            let (a, img) = w[0];
            let (b, _) = w[1];
            let end = u64::from(a) + img.len() as u64;

            (end > u64::from(b)).then_some((a, b))
        })
    }
}

impl FromIterator<(u32, PartitionImage)> for PartitionMap {
    fn from_iter<T: IntoIterator<Item = (u32, PartitionImage)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (addr, img) in iter {
            map.insert(addr, img);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::{PartitionImage, PartitionMap};

    fn img(name: &str, len: usize) -> PartitionImage {
        PartitionImage::new(name, vec![0xaa; len])
    }

    #[test]
    fn ascending_order_ignores_insertion_order() {
        let map: PartitionMap = [
            (0x10000, img("nanoCLR.bin", 16)),
            (0x1000, img("bootloader.bin", 16)),
            (0x8000, img("partitions_4mb.bin", 16)),
        ]
        .into_iter()
        .collect();

        let insertion: Vec<u32> = map.iter().map(|(a, _)| a).collect();
        assert_eq!(insertion, [0x10000, 0x1000, 0x8000]);

        let sorted: Vec<u32> = map.ascending().into_iter().map(|(a, _)| a).collect();
        assert_eq!(sorted, [0x1000, 0x8000, 0x10000]);
    }

    #[test]
    fn insert_replaces_same_address() {
        let mut map = PartitionMap::new();
        assert!(map.insert(0x1000, img("a.bin", 4)).is_none());

        let old = map.insert(0x1000, img("b.bin", 8)).unwrap();
        assert_eq!(old.name(), "a.bin");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(0x1000).unwrap().name(), "b.bin");
        assert_eq!(map.total_size(), 8);
    }

    #[test]
    fn overlap_detection() {
        let mut map = PartitionMap::new();
        map.insert(0x1000, img("a.bin", 0x1000));
        map.insert(0x2000, img("b.bin", 0x10));
        assert_eq!(map.first_overlap(), None);

        map.insert(0x2008, img("c.bin", 0x10));
        assert_eq!(map.first_overlap(), Some((0x2000, 0x2008)));
    }
}
