//! Bounded backtracking matcher.
//!
//! Alternatives are explored in priority order so the first successful path
//! is the leftmost-first match: greedy repetitions prefer longer runs, lazy
//! ones and hex gaps prefer shorter. Branch states that were fully explored
//! without success are remembered so that a buffer is never re-explored from
//! the same `(instruction, position)` pair; for programs whose loops can
//! match empty input the memo is only kept for one start offset.

use super::ast::is_word_byte;
use super::program::{Inst, Program};
use crate::deadline::{Deadline, Interrupt};
use std::collections::HashSet;

const DEADLINE_CHECK_INTERVAL: u32 = 4096;

/// Why a match attempt gave up before reaching a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchAbort {
    /// The per-attempt step budget ran out.
    StepLimit,
    Interrupted(Interrupt),
}

/// Step allowance for one match attempt.
pub struct Budget<'d> {
    remaining: u64,
    deadline: Option<&'d Deadline>,
    since_check: u32,
}

impl<'d> Budget<'d> {
    pub fn new(steps: u64, deadline: Option<&'d Deadline>) -> Self {
        Self {
            remaining: steps,
            deadline,
            since_check: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX, None)
    }

    #[inline]
    fn step(&mut self) -> Result<(), MatchAbort> {
        if self.remaining == 0 {
            return Err(MatchAbort::StepLimit);
        }
        self.remaining -= 1;
        self.since_check += 1;
        if self.since_check >= DEADLINE_CHECK_INTERVAL {
            self.since_check = 0;
            if let Some(deadline) = self.deadline {
                deadline.check().map_err(MatchAbort::Interrupted)?;
            }
        }
        Ok(())
    }
}

enum Frame {
    Explore { pc: usize, pos: usize },
    Failed { pc: usize, pos: usize },
    GapNext { pc: usize, base: usize, len: usize },
}

/// Matcher state bound to one program and reused across start offsets of
/// one input.
pub struct Backtracker<'p> {
    program: &'p Program,
    stack: Vec<Frame>,
    seen: HashSet<(usize, usize)>,
    gap_ceiling: Option<usize>,
}

impl<'p> Backtracker<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            stack: Vec::new(),
            seen: HashSet::new(),
            gap_ceiling: None,
        }
    }

    /// Caps how far an unbounded gap may stretch.
    pub fn with_gap_ceiling(mut self, ceiling: Option<usize>) -> Self {
        self.gap_ceiling = ceiling;
        self
    }

    /// Forget memoized failures; required before matching a different input.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Match anchored at `start`, returning the end offset of the match.
    pub fn match_at(
        &mut self,
        input: &[u8],
        start: usize,
        budget: &mut Budget<'_>,
    ) -> Result<Option<usize>, MatchAbort> {
        let memoize = self.program.is_memoizable();
        if !memoize {
            self.seen.clear();
        }
        self.stack.clear();
        self.stack.push(Frame::Explore { pc: 0, pos: start });
        let insts = self.program.insts();

        while let Some(frame) = self.stack.pop() {
            let (mut pc, mut pos) = match frame {
                Frame::Failed { pc, pos } => {
                    self.seen.insert((pc, pos));
                    continue;
                }
                Frame::GapNext { pc, base, len } => {
                    if !self.gap_allows(&insts[pc], len) || base + len > input.len() {
                        continue;
                    }
                    self.stack.push(Frame::GapNext {
                        pc,
                        base,
                        len: len + 1,
                    });
                    (pc + 1, base + len)
                }
                Frame::Explore { pc, pos } => (pc, pos),
            };

            loop {
                budget.step()?;
                match &insts[pc] {
                    Inst::Byte(byte) => {
                        if input.get(pos) != Some(byte) {
                            break;
                        }
                        pc += 1;
                        pos += 1;
                    }
                    Inst::Class(set) => match input.get(pos) {
                        Some(byte) if set.contains(*byte) => {
                            pc += 1;
                            pos += 1;
                        }
                        _ => break,
                    },
                    Inst::AnyByte => {
                        if pos >= input.len() {
                            break;
                        }
                        pc += 1;
                        pos += 1;
                    }
                    Inst::AnyExceptNewline => match input.get(pos) {
                        Some(byte) if *byte != b'\n' => {
                            pc += 1;
                            pos += 1;
                        }
                        _ => break,
                    },
                    Inst::Skip(count) => {
                        let count = *count as usize;
                        if input.len() - pos < count {
                            break;
                        }
                        pc += 1;
                        pos += count;
                    }
                    Inst::Split(first, second) => {
                        if !self.enter_branch(memoize, pc, pos) {
                            break;
                        }
                        self.stack.push(Frame::Explore {
                            pc: *second,
                            pos,
                        });
                        pc = *first;
                    }
                    Inst::Gap(_) => {
                        if !self.enter_branch(memoize, pc, pos) {
                            break;
                        }
                        self.stack.push(Frame::GapNext {
                            pc,
                            base: pos,
                            len: 1,
                        });
                        pc += 1;
                    }
                    Inst::Jump(target) => pc = *target,
                    Inst::AssertStart => {
                        if pos != 0 {
                            break;
                        }
                        pc += 1;
                    }
                    Inst::AssertEnd => {
                        if pos != input.len() {
                            break;
                        }
                        pc += 1;
                    }
                    Inst::WordBoundary => {
                        if !at_word_boundary(input, pos) {
                            break;
                        }
                        pc += 1;
                    }
                    Inst::NotWordBoundary => {
                        if at_word_boundary(input, pos) {
                            break;
                        }
                        pc += 1;
                    }
                    Inst::Match => {
                        self.stack.clear();
                        return Ok(Some(pos));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Leftmost match starting at or after `from`.
    pub fn find_from(
        &mut self,
        input: &[u8],
        from: usize,
        budget: &mut Budget<'_>,
    ) -> Result<Option<(usize, usize)>, MatchAbort> {
        for start in from..=input.len() {
            if let Some(end) = self.match_at(input, start, budget)? {
                return Ok(Some((start, end)));
            }
        }
        Ok(None)
    }

    /// Marks a branch state as entered; false if it is known to fail.
    fn enter_branch(&mut self, memoize: bool, pc: usize, pos: usize) -> bool {
        if memoize {
            if self.seen.contains(&(pc, pos)) {
                return false;
            }
            self.stack.push(Frame::Failed { pc, pos });
            true
        } else {
            self.seen.insert((pc, pos))
        }
    }

    fn gap_allows(&self, inst: &Inst, len: usize) -> bool {
        let limit = match inst {
            Inst::Gap(Some(max)) => Some(*max as usize),
            _ => self.gap_ceiling,
        };
        limit.map_or(true, |limit| len <= limit)
    }
}

fn at_word_boundary(input: &[u8], pos: usize) -> bool {
    let before = pos > 0 && is_word_byte(input[pos - 1]);
    let after = pos < input.len() && is_word_byte(input[pos]);
    before != after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regex::ast::Node;
    use crate::regex::parser::parse;
    use crate::regex::program::LowerOptions;

    fn program(pattern: &str) -> Program {
        Program::compile(&parse(pattern.as_bytes()).unwrap(), LowerOptions::default()).unwrap()
    }

    fn find(pattern: &str, input: &[u8]) -> Option<Vec<u8>> {
        let program = program(pattern);
        let mut matcher = Backtracker::new(&program);
        matcher
            .find_from(input, 0, &mut Budget::unlimited())
            .unwrap()
            .map(|(start, end)| input[start..end].to_vec())
    }

    #[test]
    fn test_greedy_versus_lazy() {
        assert_eq!(find("a.*bbb", b"abbbbbb"), Some(b"abbbbbb".to_vec()));
        assert_eq!(find("a.*?bbb", b"abbbbbb"), Some(b"abbb".to_vec()));
        assert_eq!(find("ab+?", b"abbbbb"), Some(b"ab".to_vec()));
        assert_eq!(find("ab{2,3}?", b"abbbbb"), Some(b"abb".to_vec()));
    }

    #[test]
    fn test_leftmost_first_alternation() {
        assert_eq!(find("(a+|b)*", b"ab"), Some(b"ab".to_vec()));
        assert_eq!(find("(abc|)ef", b"abcdef"), Some(b"ef".to_vec()));
        assert_eq!(find("ab(c|cc){1,3}d", b"abccccccd"), Some(b"abccccccd".to_vec()));
    }

    #[test]
    fn test_dot_and_newline() {
        assert_eq!(find("a.c", b"a\rc"), Some(b"a\rc".to_vec()));
        assert_eq!(find("a.c", b"a\nc"), None);
    }

    #[test]
    fn test_anchors_and_boundaries() {
        assert_eq!(find("abc|123$", b"123x"), None);
        assert_eq!(find("^abc", b"xabc"), None);
        assert_eq!(find("\\w\\w\\w\\b", b"abcd"), Some(b"bcd".to_vec()));
        assert_eq!(find("\\B\\w\\w\\w", b"abcd"), Some(b"bcd".to_vec()));
    }

    #[test]
    fn test_empty_loop_terminates() {
        assert_eq!(find("(a*)*b", b"aaab"), Some(b"aaab".to_vec()));
        assert_eq!(find("(a*)*c", b"aaab"), None);
    }

    #[test]
    fn test_memo_survives_start_offsets() {
        let program = program("a.*z");
        let input = [b'a'; 2048];
        let mut matcher = Backtracker::new(&program);
        let mut budget = Budget::new(200_000, None);
        assert_eq!(matcher.find_from(&input, 0, &mut budget), Ok(None));
    }

    #[test]
    fn test_step_limit() {
        let program = program("a.*z");
        let mut matcher = Backtracker::new(&program);
        let mut budget = Budget::new(10, None);
        assert_eq!(
            matcher.match_at(&[b'a'; 64], 0, &mut budget),
            Err(MatchAbort::StepLimit)
        );
    }

    #[test]
    fn test_gap_prefers_shortest() {
        let node = Node::Concat(vec![
            Node::Literal(b'a'),
            Node::Gap {
                min: 0,
                max: Some(3),
            },
            Node::Alternation(vec![Node::Literal(b'b'), Node::Literal(b'c')]),
        ]);
        let program = Program::compile(&node, LowerOptions::default()).unwrap();
        let mut matcher = Backtracker::new(&program);
        assert_eq!(
            matcher.match_at(b"abbb", 0, &mut Budget::unlimited()),
            Ok(Some(2))
        );
    }

    #[test]
    fn test_gap_ceiling() {
        let node = Node::Concat(vec![
            Node::Literal(b'a'),
            Node::Gap { min: 0, max: None },
            Node::Literal(b'z'),
        ]);
        let program = Program::compile(&node, LowerOptions::default()).unwrap();
        let input = b"a12345z";
        let mut unbounded = Backtracker::new(&program);
        assert_eq!(
            unbounded.match_at(input, 0, &mut Budget::unlimited()),
            Ok(Some(7))
        );
        let mut capped = Backtracker::new(&program).with_gap_ceiling(Some(3));
        assert_eq!(capped.match_at(input, 0, &mut Budget::unlimited()), Ok(None));
    }

    #[test]
    fn test_deadline_interrupts() {
        let program = program("(a|aa)*c");
        let deadline = Deadline::new(Some(std::time::Duration::ZERO), None);
        let mut matcher = Backtracker::new(&program);
        let mut budget = Budget::new(u64::MAX, Some(&deadline));
        let input = vec![b'a'; 5000];
        assert_eq!(
            matcher.find_from(&input, 0, &mut budget),
            Err(MatchAbort::Interrupted(Interrupt::Timeout))
        );
    }
}
