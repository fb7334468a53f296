//! Polyphase bookkeeping (Knuth, TAOCP 5.4.2, Algorithm D).
//!
//! With `T` tapes, slots `0..T-1` are inputs and slot `T-1` is the output.
//! While runs are distributed every input `j` satisfies
//! `runs[j] + dummy[j] == fib[j]`, where `fib` holds the generalized
//! Fibonacci targets of the current level. Merging then walks the levels
//! back down, one merge step at a time, until a single run remains.

use sortheap_common::types::BlockId;

use super::{RunRef, TapeSetState, TapeSlot};
use crate::error::{EngineError, EngineResult};

/// One input of a merge step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepInput {
    /// A dummy run; consumed without I/O.
    Dummy,
    /// The next unread run of a slot.
    Run {
        /// Slot index.
        slot: usize,
        /// Position of the run on the slot's tape.
        run_no: u32,
    },
}

/// What the merge has to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStep {
    /// The last input ran dry: go down one level and rotate the slots.
    Rotate,
    /// Every input only has dummies left: move one dummy to the output.
    AllDummy,
    /// Merge one run from every input onto the output.
    Merge {
        /// One entry per input slot.
        inputs: Vec<StepInput>,
        /// The step writes the result tape.
        final_pass: bool,
    },
    /// Nothing left to merge.
    Done,
}

impl MergeStep {
    /// Real runs read by the step.
    pub fn real_inputs(&self) -> usize {
        match self {
            Self::Merge { inputs, .. } => inputs
                .iter()
                .filter(|i| matches!(i, StepInput::Run { .. }))
                .count(),
            _ => 0,
        }
    }
}

impl TapeSetState {
    /// Number of input slots.
    pub fn inputs(&self) -> usize {
        self.tapes.len().saturating_sub(1)
    }

    /// Index of the output slot.
    pub fn output(&self) -> usize {
        self.inputs()
    }

    /// Step D1: resets every slot for a new distribution at level 1.
    ///
    /// Tape headers are kept; the run positions of a reused tape stay valid.
    pub fn start_distribution(&mut self) {
        let output = self.output();
        for (j, slot) in self.tapes.iter_mut().enumerate() {
            let target = u32::from(j != output);
            *slot = TapeSlot {
                header: slot.header,
                runs: 0,
                dummy: target,
                fib: target,
                consumed: slot.consumed,
            };
        }
        self.level = 1;
        self.dest = 0;
        self.dumps = 0;
    }

    /// Starts distributing a new cycle, optionally seeded with the result
    /// run of the previous one on slot 0.
    pub fn start_cycle(&mut self, base: Option<BlockId>) {
        let tapes = self.tapes.len();
        self.tapes = vec![TapeSlot::empty(); tapes];
        self.start_distribution();
        self.base = base.map(|tape| RunRef { tape, run_no: 0 });
        if let Some(tape) = base {
            let slot = &mut self.tapes[0];
            slot.header = tape;
            slot.runs = 1;
            slot.dummy -= 1;
            self.select_new_tape();
        }
        self.result = BlockId::INVALID;
        self.merge_worthwhile = false;
    }

    /// Accounts for a run just written to the destination slot.
    pub fn record_dump(&mut self) -> EngineResult<()> {
        let slot = self
            .tapes
            .get_mut(self.dest)
            .ok_or_else(|| EngineError::invalid_state("destination slot out of range"))?;
        if slot.dummy == 0 {
            return Err(EngineError::invalid_state(format!(
                "destination slot {} has no dummy run left",
                self.dest
            )));
        }
        slot.runs += 1;
        slot.dummy -= 1;
        self.dumps += 1;
        Ok(())
    }

    /// Steps D3/D4: picks the slot for the next run, raising the level once
    /// every dummy of the current one is used up.
    pub fn select_new_tape(&mut self) {
        let inputs = self.inputs();
        let j = self.dest;
        if j + 1 < inputs && self.tapes[j].dummy < self.tapes[j + 1].dummy {
            self.dest = j + 1;
            return;
        }
        if self.tapes[j].dummy != 0 {
            self.dest = 0;
            return;
        }
        self.level += 1;
        let a = self.tapes[0].fib;
        for j in 0..inputs {
            let next = if j + 1 < inputs { self.tapes[j + 1].fib } else { 0 };
            self.tapes[j].dummy = a + next - self.tapes[j].fib;
            self.tapes[j].fib = a + next;
        }
        self.dest = 0;
    }

    /// Sum of the targets of every input slot.
    pub fn fib_sum(&self) -> u64 {
        self.tapes[..self.inputs()]
            .iter()
            .map(|s| u64::from(s.fib))
            .sum()
    }

    /// Checks the distribution invariant of the current level.
    pub fn check_invariant(&self) -> Result<(), String> {
        let inputs = self.inputs();
        if inputs < 2 {
            return Err(format!("{} tapes cannot merge", self.tapes.len()));
        }
        let expected = fibonacci_targets(inputs, self.level);
        for (j, slot) in self.tapes[..inputs].iter().enumerate() {
            if slot.runs + slot.dummy != slot.fib {
                return Err(format!(
                    "slot {j}: {} runs + {} dummies != target {}",
                    slot.runs, slot.dummy, slot.fib
                ));
            }
            if slot.fib != expected[j] {
                return Err(format!(
                    "slot {j}: target {} at level {}, expected {}",
                    slot.fib, self.level, expected[j]
                ));
            }
        }
        let output = &self.tapes[inputs];
        if output.runs != 0 || output.dummy != 0 {
            return Err(format!(
                "output slot holds {} runs and {} dummies",
                output.runs, output.dummy
            ));
        }
        if self.dest >= inputs || (self.tapes[self.dest].dummy == 0 && self.level > 0) {
            return Err(format!("destination slot {} has no room", self.dest));
        }
        Ok(())
    }

    /// Decides the next merge step (D5/D6).
    pub fn next_merge_step(&self) -> EngineResult<MergeStep> {
        if self.level == 0 {
            return Ok(MergeStep::Done);
        }
        let inputs = self.inputs();
        let last = &self.tapes[inputs - 1];
        if last.runs == 0 && last.dummy == 0 {
            if self.level == 1 {
                return Err(EngineError::invalid_state(
                    "last input tape ran dry before the final pass",
                ));
            }
            return Ok(MergeStep::Rotate);
        }
        let all_dummy = self.tapes[..inputs].iter().all(|s| s.dummy > 0);
        if all_dummy && self.level > 1 {
            return Ok(MergeStep::AllDummy);
        }
        let mut step_inputs = Vec::with_capacity(inputs);
        for (slot, tape) in self.tapes[..inputs].iter().enumerate() {
            if tape.dummy > 0 {
                step_inputs.push(StepInput::Dummy);
            } else if tape.runs > 0 {
                step_inputs.push(StepInput::Run {
                    slot,
                    run_no: tape.consumed,
                });
            } else {
                return Err(EngineError::invalid_state(format!(
                    "input slot {slot} is empty at level {}",
                    self.level
                )));
            }
        }
        Ok(MergeStep::Merge {
            inputs: step_inputs,
            final_pass: self.level == 1,
        })
    }

    /// Applies the bookkeeping of `step` once its output is committed.
    pub fn apply_merge_step(&mut self, step: &MergeStep) {
        let inputs = self.inputs();
        match step {
            MergeStep::Rotate => {
                self.level -= 1;
                self.tapes.rotate_right(1);
            }
            MergeStep::AllDummy => {
                self.tapes[inputs].dummy += 1;
                for slot in &mut self.tapes[..inputs] {
                    slot.dummy -= 1;
                }
            }
            MergeStep::Merge {
                inputs: step_inputs,
                final_pass,
            } => {
                for (slot, input) in self.tapes.iter_mut().zip(step_inputs) {
                    match input {
                        StepInput::Dummy => slot.dummy -= 1,
                        StepInput::Run { .. } => {
                            slot.runs -= 1;
                            slot.consumed += 1;
                        }
                    }
                }
                if *final_pass {
                    self.level = 0;
                } else {
                    self.tapes[inputs].runs += 1;
                }
            }
            MergeStep::Done => {}
        }
    }
}

/// Targets of `inputs` input tapes at `level`.
fn fibonacci_targets(inputs: usize, level: u32) -> Vec<u32> {
    let mut fib = vec![1u32; inputs];
    for _ in 1..level {
        let a = fib[0];
        for j in 0..inputs {
            let next = if j + 1 < inputs { fib[j + 1] } else { 0 };
            fib[j] = a + next;
        }
    }
    fib
}
