//! The boolean state lattice of a value.
//!
//! # Purpose
//!
//! - Define the state bits a value accumulates over its lifetime and the
//!   rules binding them: what each bit implies, what it forbids, what its
//!   absence implies, and the precondition clauses that permit enabling it.
//! - Provide the generic solver that drives a value from its current state
//!   to any requested state by walking the clause table, instead of
//!   hand-rolled per-bit logic.
//!
//! # Mental model
//!
//! State only ever grows: enabling a bit may do work (serialise, byteswap,
//! verify, reconstruct) but never invalidates an already-set bit. `LOCKED`
//! is the single exception; it is the per-value lock and is cleared on
//! unlock. The clause graph is acyclic by construction, so recursive
//! enabling terminates.
//!
//! # Invariants
//!
//! 1. A state is valid iff for every set bit its `implies` set is set and
//!    its `forbids` set is clear, and for every clear bit its
//!    `absent_implies` set is set. Checked by [`assert_valid`] after every
//!    transition.
//! 2. Enabling respects clause preconditions: a clause is taken only when
//!    its `forbidden` bits are clear and its `required` bits are set or
//!    recursively enableable; among feasible clauses the one with the
//!    fewest missing bits is preferred.
//! 3. No solver path ever clears a bit. Tested by the lattice monotonicity
//!    tests in `value.rs`.

use bitflags::bitflags;

bitflags! {
	/// State bits of a value. See the module docs for the rules.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct State: u32 {
		/// Byte order matched the host when the bytes were obtained.
		const SOURCE_NATIVE = 1 << 0;
		/// Byte order was made to match the host by an in-place swap.
		const BECAME_NATIVE = 1 << 1;
		/// Byte order matches the host.
		const NATIVE = 1 << 2;
		/// The source declared the bytes normalised.
		const SOURCE_TRUSTED = 1 << 3;
		/// Normalisation was verified on these exact bytes.
		const BECAME_TRUSTED = 1 << 4;
		/// The bytes are known to be normalised.
		const TRUSTED = 1 << 5;
		/// The type has a known fixed serialised size.
		const FIXED_SIZE = 1 << 6;
		/// The cached size field is filled in.
		const SIZE_KNOWN = 1 << 7;
		/// The cached size is trustworthy for extraction.
		const SIZE_VALID = 1 << 8;
		/// The payload is a serialised byte window.
		const SERIALISED = 1 << 9;
		/// The serialised window is in a buffer this value owns.
		const INDEPENDENT = 1 << 10;
		/// The bytes were rebuilt to normalise an untrusted input.
		const RECONSTRUCTED = 1 << 11;
		/// Sentinel that owns externally-provided bytes.
		const NOTIFY = 1 << 12;
		/// Per-value lock; the only clearable bit.
		const LOCKED = 1 << 31;
	}
}

/// Work performed when a clause enables its bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
	/// The required bits alone establish the condition.
	Nop,
	/// Compute and cache the serialised size.
	ComputeSize,
	/// Serialise the tree payload into a fresh buffer.
	Serialise,
	/// Copy the borrowed window into a buffer of our own.
	CopyToOwn,
	/// Swap the owned bytes to host order in place.
	ByteswapInPlace,
	/// Run the byte-level normal-form check; fails if not normal.
	VerifyNormal,
	/// Rebuild normalised native bytes by deep copy and re-serialise.
	Reconstruct,
}

/// One way of enabling a bit.
pub(crate) struct Clause {
	pub required: State,
	pub forbidden: State,
	pub action: Action,
}

/// The rules attached to one bit.
pub(crate) struct Condition {
	pub bit: State,
	/// Bits that must be set whenever `bit` is set.
	pub implies: State,
	/// Bits that must be clear whenever `bit` is set.
	pub forbids: State,
	/// Bits that must be set whenever `bit` is clear.
	pub absent_implies: State,
	pub clauses: &'static [Clause],
}

const fn join(a: State, b: State) -> State {
	State::from_bits_retain(a.bits() | b.bits())
}

const NONE: State = State::empty();

static CONDITIONS: &[Condition] = &[
	Condition {
		bit: State::SOURCE_NATIVE,
		implies: NONE,
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[],
	},
	Condition {
		bit: State::BECAME_NATIVE,
		implies: join(State::SERIALISED, State::INDEPENDENT),
		forbids: State::SOURCE_NATIVE,
		absent_implies: NONE,
		clauses: &[Clause {
			required: join(join(State::SERIALISED, State::INDEPENDENT), State::SIZE_KNOWN),
			forbidden: join(join(State::SOURCE_NATIVE, State::NATIVE), State::NOTIFY),
			action: Action::ByteswapInPlace,
		}],
	},
	Condition {
		bit: State::NATIVE,
		implies: NONE,
		forbids: NONE,
		// Only serialised values can be in foreign order; a value that is
		// not yet native must at least be serialised.
		absent_implies: State::SERIALISED,
		clauses: &[
			Clause {
				required: State::SOURCE_NATIVE,
				forbidden: NONE,
				action: Action::Nop,
			},
			Clause {
				required: State::BECAME_NATIVE,
				forbidden: NONE,
				action: Action::Nop,
			},
			Clause {
				required: State::RECONSTRUCTED,
				forbidden: NONE,
				action: Action::Nop,
			},
		],
	},
	Condition {
		bit: State::SOURCE_TRUSTED,
		implies: NONE,
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[],
	},
	Condition {
		bit: State::BECAME_TRUSTED,
		implies: join(State::SERIALISED, State::NATIVE),
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[Clause {
			required: join(join(State::SERIALISED, State::NATIVE), State::SIZE_KNOWN),
			forbidden: State::SOURCE_TRUSTED,
			action: Action::VerifyNormal,
		}],
	},
	Condition {
		bit: State::TRUSTED,
		implies: NONE,
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[
			Clause {
				required: State::SOURCE_TRUSTED,
				forbidden: NONE,
				action: Action::Nop,
			},
			Clause {
				required: State::BECAME_TRUSTED,
				forbidden: NONE,
				action: Action::Nop,
			},
			Clause {
				required: State::RECONSTRUCTED,
				forbidden: NONE,
				action: Action::Nop,
			},
		],
	},
	Condition {
		bit: State::FIXED_SIZE,
		implies: join(State::SIZE_KNOWN, State::SIZE_VALID),
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[],
	},
	Condition {
		bit: State::SIZE_KNOWN,
		implies: NONE,
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[Clause {
			required: NONE,
			forbidden: NONE,
			action: Action::ComputeSize,
		}],
	},
	Condition {
		bit: State::SIZE_VALID,
		implies: State::SIZE_KNOWN,
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[
			Clause {
				required: join(State::SERIALISED, State::SIZE_KNOWN),
				forbidden: NONE,
				action: Action::Nop,
			},
			Clause {
				required: join(State::TRUSTED, State::SIZE_KNOWN),
				forbidden: NONE,
				action: Action::Nop,
			},
		],
	},
	Condition {
		bit: State::SERIALISED,
		implies: State::SIZE_KNOWN,
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[Clause {
			required: State::SIZE_KNOWN,
			forbidden: State::NOTIFY,
			action: Action::Serialise,
		}],
	},
	Condition {
		bit: State::INDEPENDENT,
		implies: State::SERIALISED,
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[Clause {
			required: State::SERIALISED,
			forbidden: State::NOTIFY,
			action: Action::CopyToOwn,
		}],
	},
	Condition {
		bit: State::RECONSTRUCTED,
		implies: join(join(State::SERIALISED, State::INDEPENDENT), State::SIZE_KNOWN),
		forbids: NONE,
		absent_implies: NONE,
		clauses: &[Clause {
			required: NONE,
			forbidden: State::NOTIFY,
			action: Action::Reconstruct,
		}],
	},
	Condition {
		bit: State::NOTIFY,
		implies: NONE,
		forbids: State::SERIALISED,
		absent_implies: NONE,
		clauses: &[],
	},
];

fn condition(bit: State) -> &'static Condition {
	CONDITIONS
		.iter()
		.find(|c| c.bit == bit)
		.unwrap_or_else(|| panic!("no condition row for {bit:?}"))
}

/// Performs the work behind clause actions. Implemented by the value's
/// locked payload.
pub(crate) trait Perform {
	/// Runs `action` against the payload under the current `state`.
	///
	/// Returns the extra bits the action establishes beyond the bit being
	/// enabled, or `None` when the action cannot succeed on this value
	/// (the solver then tries the next clause).
	fn perform(&mut self, action: Action, state: State) -> Option<State>;
}

/// Drives `state` until it contains `wanted`, running clause actions
/// through `doer`. Returns the new state, or `None` if some wanted bit has
/// no feasible clause.
pub(crate) fn solve(mut state: State, wanted: State, doer: &mut impl Perform) -> Option<State> {
	for bit in wanted.iter() {
		state = enable(state, bit, doer)?;
	}
	debug_assert!(is_valid(state), "invalid state {state:?} after solve");
	Some(state)
}

fn enable(state: State, bit: State, doer: &mut impl Perform) -> Option<State> {
	if state.contains(bit) {
		return Some(state);
	}
	let cond = condition(bit);

	// Feasible clauses, fewest missing required bits first; table order
	// breaks ties.
	let mut order: Vec<usize> = (0..cond.clauses.len())
		.filter(|&i| !state.intersects(cond.clauses[i].forbidden))
		.collect();
	order.sort_by_key(|&i| (cond.clauses[i].required - state).bits().count_ones());

	'clauses: for i in order {
		let clause = &cond.clauses[i];
		let mut attempt = state;
		for required in (clause.required - state).iter() {
			match enable(attempt, required, doer) {
				Some(next) => attempt = next,
				None => continue 'clauses,
			}
		}
		// Enabling a requirement may have tripped a forbidden bit.
		if attempt.intersects(clause.forbidden) {
			continue;
		}
		let Some(extra) = doer.perform(clause.action, attempt) else {
			continue;
		};
		return Some(attempt | bit | extra);
	}
	None
}

/// Whether every condition's implies / forbids / absence-implies rules
/// hold for `state`.
#[must_use]
pub(crate) fn is_valid(state: State) -> bool {
	CONDITIONS.iter().all(|cond| {
		if state.contains(cond.bit) {
			state.contains(cond.implies) && !state.intersects(cond.forbids)
		} else {
			state.contains(cond.absent_implies)
		}
	})
}

/// Debug assertion form of [`is_valid`].
pub(crate) fn assert_valid(state: State) {
	debug_assert!(is_valid(state), "invalid value state {state:?}");
}
