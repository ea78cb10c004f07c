//! Lowering of [`Node`] trees into backtracking instructions.

use super::ast::{ByteSet, Node};
use super::RegexError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Inst {
    Byte(u8),
    Class(ByteSet),
    AnyByte,
    AnyExceptNewline,
    /// Try `.0` first, fall back to `.1`.
    Split(usize, usize),
    Jump(usize),
    /// Consume exactly this many arbitrary bytes.
    Skip(u32),
    /// Consume zero or more arbitrary bytes, shortest first.
    Gap(Option<u32>),
    AssertStart,
    AssertEnd,
    WordBoundary,
    NotWordBoundary,
    Match,
}

/// Options applied while lowering a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerOptions {
    pub nocase: bool,
    pub dotall: bool,
    /// Follow every consumed byte with a zero byte.
    pub wide: bool,
    pub max_size: usize,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            nocase: false,
            dotall: false,
            wide: false,
            max_size: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    insts: Vec<Inst>,
    /// Whether failed `(pc, position)` states may be remembered across start offsets.
    memoizable: bool,
}

impl Program {
    /// # Errors
    ///
    /// Fails when the program would exceed `options.max_size` instructions.
    pub fn compile(node: &Node, options: LowerOptions) -> Result<Self, RegexError> {
        let mut emitter = Emitter {
            insts: Vec::new(),
            options,
        };
        emitter.emit(node)?;
        emitter.push(Inst::Match)?;
        Ok(Program {
            insts: emitter.insts,
            memoizable: !node.has_empty_loop(),
        })
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn is_memoizable(&self) -> bool {
        self.memoizable
    }
}

struct Emitter {
    insts: Vec<Inst>,
    options: LowerOptions,
}

impl Emitter {
    fn push(&mut self, inst: Inst) -> Result<usize, RegexError> {
        if self.insts.len() >= self.options.max_size {
            return Err(RegexError::new("regular expression is too large", 0));
        }
        self.insts.push(inst);
        Ok(self.insts.len() - 1)
    }

    fn consume(&mut self, inst: Inst) -> Result<(), RegexError> {
        self.push(inst)?;
        if self.options.wide {
            self.push(Inst::Byte(0))?;
        }
        Ok(())
    }

    fn emit(&mut self, node: &Node) -> Result<(), RegexError> {
        match node {
            Node::Empty => {}
            Node::Literal(byte) => {
                if self.options.nocase && byte.is_ascii_alphabetic() {
                    let mut set = ByteSet::single(*byte);
                    set.fold_case();
                    self.consume(Inst::Class(set))?;
                } else {
                    self.consume(Inst::Byte(*byte))?;
                }
            }
            Node::Class(set) => {
                let mut set = *set;
                if self.options.nocase {
                    set.fold_case();
                }
                self.consume(Inst::Class(set))?;
            }
            Node::Any if self.options.dotall => self.consume(Inst::AnyByte)?,
            Node::Any => self.consume(Inst::AnyExceptNewline)?,
            Node::AnyByte => {
                self.push(Inst::AnyByte)?;
            }
            Node::StartAnchor => {
                self.push(Inst::AssertStart)?;
            }
            Node::EndAnchor => {
                self.push(Inst::AssertEnd)?;
            }
            Node::WordBoundary => {
                self.push(Inst::WordBoundary)?;
            }
            Node::NotWordBoundary => {
                self.push(Inst::NotWordBoundary)?;
            }
            Node::Concat(nodes) => {
                for node in nodes {
                    self.emit(node)?;
                }
            }
            Node::Group(node) => self.emit(node)?,
            Node::Alternation(alternatives) => self.emit_alternation(alternatives)?,
            Node::Repeat {
                node,
                min,
                max,
                greedy,
            } => self.emit_repeat(node, *min, *max, *greedy)?,
            Node::Gap { min, max } => {
                if *min > 0 {
                    self.push(Inst::Skip(*min))?;
                }
                match max {
                    Some(max) if max == min => {}
                    Some(max) => {
                        self.push(Inst::Gap(Some(max - min)))?;
                    }
                    None => {
                        self.push(Inst::Gap(None))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_alternation(&mut self, alternatives: &[Node]) -> Result<(), RegexError> {
        let mut exits = Vec::with_capacity(alternatives.len());
        let (last, rest) = match alternatives.split_last() {
            Some(split) => split,
            None => return Ok(()),
        };
        for alternative in rest {
            let split = self.push(Inst::Split(0, 0))?;
            self.emit(alternative)?;
            exits.push(self.push(Inst::Jump(0))?);
            let next = self.insts.len();
            self.insts[split] = Inst::Split(split + 1, next);
        }
        self.emit(last)?;
        let end = self.insts.len();
        for exit in exits {
            self.insts[exit] = Inst::Jump(end);
        }
        Ok(())
    }

    fn emit_repeat(
        &mut self,
        node: &Node,
        min: u32,
        max: Option<u32>,
        greedy: bool,
    ) -> Result<(), RegexError> {
        for _ in 0..min {
            self.emit(node)?;
        }
        let branch = |body: usize, exit: usize| {
            if greedy {
                Inst::Split(body, exit)
            } else {
                Inst::Split(exit, body)
            }
        };
        match max {
            None => {
                let split = self.push(Inst::Split(0, 0))?;
                self.emit(node)?;
                self.push(Inst::Jump(split))?;
                let end = self.insts.len();
                self.insts[split] = branch(split + 1, end);
            }
            Some(max) => {
                let mut splits = Vec::new();
                for _ in min..max {
                    splits.push(self.push(Inst::Split(0, 0))?);
                    self.emit(node)?;
                }
                let end = self.insts.len();
                for split in splits {
                    self.insts[split] = branch(split + 1, end);
                }
            }
        }
        Ok(())
    }
}
