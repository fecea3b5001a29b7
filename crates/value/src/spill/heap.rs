//! Binary heap operations over a slice, ordered by a caller-supplied
//! comparator. The element for which `less` holds against every other
//! element sits at index 0.

pub(crate) fn init<T>(heap: &mut [T], less: impl Fn(&T, &T) -> bool) {
	let n = heap.len();
	for i in (0..n / 2).rev() {
		down(heap, i, n, &less);
	}
}

pub(crate) fn push<T>(heap: &mut Vec<T>, item: T, less: impl Fn(&T, &T) -> bool) {
	heap.push(item);
	let n = heap.len();
	up(heap, n - 1, &less);
}

pub(crate) fn pop<T>(heap: &mut Vec<T>, less: impl Fn(&T, &T) -> bool) -> Option<T> {
	let n = heap.len();
	if n == 0 {
		return None;
	}
	heap.swap(0, n - 1);
	down(heap, 0, n - 1, &less);
	heap.pop()
}

/// Re-establishes the heap order after the element at `i` changed
pub(crate) fn fix<T>(heap: &mut [T], i: usize, less: impl Fn(&T, &T) -> bool) {
	let n = heap.len();
	if !down(heap, i, n, &less) {
		up(heap, i, &less);
	}
}

fn up<T>(heap: &mut [T], mut j: usize, less: &impl Fn(&T, &T) -> bool) {
	while j > 0 {
		let i = (j - 1) / 2;
		if !less(&heap[j], &heap[i]) {
			break;
		}
		heap.swap(i, j);
		j = i;
	}
}

/// Sifts the element at `i0` down within the first `n` elements, returning
/// whether it moved
fn down<T>(heap: &mut [T], i0: usize, n: usize, less: &impl Fn(&T, &T) -> bool) -> bool {
	let mut i = i0;
	loop {
		let left = 2 * i + 1;
		if left >= n {
			break;
		}
		let mut j = left;
		let right = left + 1;
		if right < n && less(&heap[right], &heap[left]) {
			j = right;
		}
		if !less(&heap[j], &heap[i]) {
			break;
		}
		heap.swap(i, j);
		i = j;
	}
	i > i0
}

#[cfg(test)]
mod tests {
	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};

	use super::*;

	#[test]
	fn pops_in_order() {
		let mut rng = StdRng::seed_from_u64(1985);
		let mut heap = Vec::new();
		let mut all: Vec<u32> = (0..200).map(|_| rng.gen_range(0..50)).collect();
		for v in &all {
			push(&mut heap, *v, |a, b| a < b);
		}
		all.sort();
		let mut popped = Vec::new();
		while let Some(v) = pop(&mut heap, |a, b| a < b) {
			popped.push(v);
		}
		assert_eq!(popped, all);
	}

	#[test]
	fn max_heap_by_reversed_comparator() {
		let mut heap = vec![3, 9, 1, 7, 5];
		init(&mut heap, |a, b| b < a);
		assert_eq!(heap[0], 9);
		heap[0] = 0;
		fix(&mut heap, 0, |a, b| b < a);
		assert_eq!(heap[0], 7);
	}

	#[test]
	fn fix_moves_elements_up() {
		let mut heap = vec![1, 2, 3, 4, 5, 6];
		init(&mut heap, |a, b| a < b);
		let last = heap.len() - 1;
		heap[last] = 0;
		fix(&mut heap, last, |a, b| a < b);
		assert_eq!(heap[0], 0);
	}
}
