use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Ring buffer of the spike vectors of the last `max_delay` steps, one row per
/// batch element. Slot 0 holds the spikes of the previous step, slot `d` those
/// emitted `d + 1` steps ago.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayBuffer {
    slots: Array3<f32>,
    current_pos: usize,
}

impl DelayBuffer {
    pub fn new(max_delay: usize, batch_size: usize, num_neurons: usize) -> DelayBuffer {
        assert!(max_delay > 0, "delay buffer needs at least one slot");
        DelayBuffer {
            slots: Array3::zeros((max_delay, batch_size, num_neurons)),
            current_pos: 0,
        }
    }

    pub fn max_delay(&self) -> usize {
        self.slots.len_of(Axis(0))
    }

    pub fn batch_size(&self) -> usize {
        self.slots.len_of(Axis(1))
    }

    pub fn num_neurons(&self) -> usize {
        self.slots.len_of(Axis(2))
    }

    fn get_slot_pos(&self, delay_slot: usize) -> usize {
        #[cfg(debug_assertions)]
        assert!(delay_slot < self.max_delay());

        let mut pos = self.current_pos + delay_slot;

        if pos >= self.max_delay() {
            pos -= self.max_delay();
        }

        pos
    }

    pub fn slot(&self, delay_slot: usize) -> ArrayView2<f32> {
        self.slots.index_axis(Axis(0), self.get_slot_pos(delay_slot))
    }

    pub fn latest(&self) -> ArrayView2<f32> {
        self.slot(0)
    }

    /// Spike of `nid` in row `row`, addressed by the delay-expanded column
    /// `delay_slot * num_neurons + nid`.
    pub fn expanded_value(&self, row: usize, col: usize) -> f32 {
        let num_neurons = self.num_neurons();
        let pos = self.get_slot_pos(col / num_neurons);
        self.slots[[pos, row, col % num_neurons]]
    }

    /// Makes `spikes` the most recent entry, dropping the oldest one.
    pub fn push(&mut self, spikes: ArrayView2<f32>) {
        assert_eq!(
            spikes.dim(),
            (self.batch_size(), self.num_neurons()),
            "spike shape does not match delay buffer"
        );

        self.current_pos = if self.current_pos == 0 {
            self.max_delay() - 1
        } else {
            self.current_pos - 1
        };

        self.slots
            .index_axis_mut(Axis(0), self.current_pos)
            .assign(&spikes);
    }

    /// Slots in logical order (most recent first), flattened to
    /// `(batch, max_delay * num_neurons)`.
    pub fn to_expanded(&self) -> Array2<f32> {
        let num_neurons = self.num_neurons();
        let mut result = Array2::zeros((self.batch_size(), self.max_delay() * num_neurons));

        for delay_slot in 0..self.max_delay() {
            result
                .slice_mut(s![.., delay_slot * num_neurons..(delay_slot + 1) * num_neurons])
                .assign(&self.slot(delay_slot));
        }

        result
    }

    pub fn select_rows(&self, rows: Range<usize>) -> DelayBuffer {
        DelayBuffer {
            slots: self.slots.slice(s![.., rows, ..]).to_owned(),
            current_pos: self.current_pos,
        }
    }

    /// Stacks buffers along the batch axis, normalizing their ring positions.
    pub fn concatenate(parts: &[DelayBuffer]) -> DelayBuffer {
        assert!(!parts.is_empty(), "nothing to concatenate");
        let max_delay = parts[0].max_delay();
        let num_neurons = parts[0].num_neurons();
        let batch_size = parts.iter().map(|part| part.batch_size()).sum();

        let mut result = DelayBuffer::new(max_delay, batch_size, num_neurons);
        let mut row_start = 0;

        for part in parts {
            assert_eq!(part.max_delay(), max_delay);
            assert_eq!(part.num_neurons(), num_neurons);
            let rows = row_start..row_start + part.batch_size();

            for delay_slot in 0..max_delay {
                result
                    .slots
                    .slice_mut(s![delay_slot, rows.clone(), ..])
                    .assign(&part.slot(delay_slot));
            }

            row_start = rows.end;
        }

        result
    }
}
