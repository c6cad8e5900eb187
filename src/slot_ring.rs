use crate::seq::SequenceNumber;

/// Fixed-capacity circular slot array addressed by sequence number, used to track
///  recently-sent reliable datagrams so ACK/NACK processing can find them in O(1).
///
/// The capacity is rounded up to a power of two and addressing is `sequence & mask`,
///  so the array holds a bounded history: overwriting a slot means the datagram that
///  occupied it is presumed lost and no longer tracked. Each slot stores the full
///  sequence number alongside the value, which makes lookups and removals conditional -
///  a slot that has been recycled for a newer sequence number no longer answers for
///  the old one.
pub struct SlotRing<T> {
    slots: Vec<Option<(SequenceNumber, T)>>,
    mask: u32,
}

impl<T> SlotRing<T> {
    pub fn new(capacity: usize) -> SlotRing<T> {
        let capacity = capacity.next_power_of_two().max(2);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        SlotRing {
            slots,
            mask: (capacity - 1) as u32,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, sequence_number: SequenceNumber) -> usize {
        (sequence_number.to_raw() & self.mask) as usize
    }

    pub fn get(&self, sequence_number: SequenceNumber) -> Option<&T> {
        match &self.slots[self.index(sequence_number)] {
            Some((stored, value)) if *stored == sequence_number => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, sequence_number: SequenceNumber) -> Option<&mut T> {
        let idx = self.index(sequence_number);
        match &mut self.slots[idx] {
            Some((stored, value)) if *stored == sequence_number => Some(value),
            _ => None,
        }
    }

    /// stores a value, releasing (returning) whatever occupied the slot before
    pub fn set(&mut self, sequence_number: SequenceNumber, value: T) -> Option<T> {
        let idx = self.index(sequence_number);
        self.slots[idx]
            .replace((sequence_number, value))
            .map(|(_, old)| old)
    }

    /// Conditional delete: clears the slot only if it still holds the given sequence
    ///  number. Returns `None` if the slot is empty or has been recycled for a newer
    ///  sequence number in the meantime.
    pub fn remove(&mut self, sequence_number: SequenceNumber) -> Option<T> {
        let idx = self.index(sequence_number);
        match &self.slots[idx] {
            Some((stored, _)) if *stored == sequence_number => {
                self.slots[idx].take().map(|(_, value)| value)
            }
            _ => None,
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.iter_mut()
            .filter_map(|slot| slot.take().map(|(_, value)| value))
    }
}
