//! Line-buffered finite state machine (C3) turning the LLM runner's raw
//! stdout into a sequence of typed [`ParserEvent`]s.
//!
//! The state table below is data, not a second imperative copy per dialect:
//! the legacy dialect is simply the same table entered directly at
//! [`State::InSubTodos`] (no `<final_answer>`/`Todo:` preamble), so both
//! dialects share this one engine. `Parser` derives no `Clone`/`Sync`, so
//! accidental concurrent feeds from two tasks are a compile error rather
//! than a runtime race; ownership is the single-writer guarantee.

use std::fmt;

/// A high-level event produced by the parser, destined for C1's SSE
/// serializer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParserEvent {
    RedefineTitle(String),
    TaskStart { number: u32, title: String },
    TaskGoal { index: u32, objective: String },
    TaskDeliverable { index: u32, deliverable: String },
    TaskEnd(u32),
    Complete,
}

/// A malformed task-number line. Recoverable: the parser stays in its
/// current state so later lines are still consumed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseError {
    pub line: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed task number on line {:?}", self.line)
    }
}

impl std::error::Error for ParseError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Normal,
    InFinalAnswer,
    InTodo,
    InSubTodos,
    InTask,
    InObjective,
    InDeliverable,
}

#[derive(Clone, Debug)]
struct TaskBuffer {
    number: u32,
    objective: Option<String>,
    objective_emitted: bool,
    deliverable: Option<String>,
}

/// The streaming parser. One instance belongs to exactly one orchestrator
/// request and is fed via `&mut self`.
pub struct Parser {
    state: State,
    buffer: Vec<u8>,
    current: Option<TaskBuffer>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            buffer: Vec::new(),
            current: None,
        }
    }

    /// Appends `chunk`, splits on newline, and processes every complete
    /// line. The trailing incomplete fragment is retained for the next
    /// call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<ParserEvent, ParseError>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();
            self.process_line(&line, &mut out);
        }
        out
    }

    /// Terminal sweep: drains any trailing fragment as if newline-terminated,
    /// finalizes an in-flight task, and emits `Complete` if not already in
    /// `Normal`.
    pub fn finalize(&mut self) -> Vec<Result<ParserEvent, ParseError>> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let remaining = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&remaining).into_owned();
            self.process_line(&line, &mut out);
        }
        self.finalize_current(&mut out);
        if self.state != State::Normal {
            out.push(Ok(ParserEvent::Complete));
            self.state = State::Normal;
        }
        out
    }

    fn process_line(&mut self, raw_line: &str, out: &mut Vec<Result<ParserEvent, ParseError>>) {
        let line = raw_line.trim();
        if line.is_empty() {
            return;
        }

        match self.state {
            State::Normal => {
                if line == "<final_answer>" {
                    self.state = State::InFinalAnswer;
                } else if line == "Sub-Todos:" {
                    self.state = State::InSubTodos;
                } else if let Some(task) = try_parse_task_line(line) {
                    self.enter_task(task, out);
                }
            }
            State::InFinalAnswer => {
                if line == "</final_answer>" {
                    self.finalize_current(out);
                    self.state = State::Normal;
                    out.push(Ok(ParserEvent::Complete));
                } else if let Some(rest) = line.strip_prefix("Todo:") {
                    out.push(Ok(ParserEvent::RedefineTitle(rest.trim().to_owned())));
                    self.state = State::InTodo;
                }
            }
            State::InTodo => {
                if line == "Sub-Todos:" {
                    self.state = State::InSubTodos;
                }
            }
            State::InSubTodos => {
                if let Some(task) = try_parse_task_line(line) {
                    self.enter_task(task, out);
                }
            }
            State::InTask => {
                if let Some(rest) = line.strip_prefix("- Objective:") {
                    if let Some(cur) = &mut self.current {
                        cur.objective = Some(rest.trim().to_owned());
                    }
                    self.state = State::InObjective;
                } else if let Some(task) = try_parse_task_line(line) {
                    self.finalize_current(out);
                    self.enter_task(task, out);
                }
            }
            State::InObjective => {
                if let Some(rest) = line.strip_prefix("- Deliverable:") {
                    if let Some(cur) = &mut self.current {
                        if let Some(objective) = cur.objective.clone() {
                            out.push(Ok(ParserEvent::TaskGoal {
                                index: cur.number,
                                objective,
                            }));
                            cur.objective_emitted = true;
                        }
                        cur.deliverable = Some(rest.trim().to_owned());
                    }
                    self.state = State::InDeliverable;
                } else if let Some(task) = try_parse_task_line(line) {
                    self.finalize_current(out);
                    self.enter_task(task, out);
                } else if let Some(cur) = &mut self.current {
                    append_continuation(&mut cur.objective, line);
                }
            }
            State::InDeliverable => {
                if line == "</final_answer>" {
                    self.finalize_current(out);
                    self.state = State::Normal;
                    out.push(Ok(ParserEvent::Complete));
                } else if let Some(task) = try_parse_task_line(line) {
                    self.finalize_current(out);
                    self.enter_task(task, out);
                } else if let Some(cur) = &mut self.current {
                    append_continuation(&mut cur.deliverable, line);
                }
            }
        }
    }

    fn enter_task(
        &mut self,
        task: Result<(u32, String), ParseError>,
        out: &mut Vec<Result<ParserEvent, ParseError>>,
    ) {
        match task {
            Ok((number, title)) => {
                self.current = Some(TaskBuffer {
                    number,
                    objective: None,
                    objective_emitted: false,
                    deliverable: None,
                });
                self.state = State::InTask;
                out.push(Ok(ParserEvent::TaskStart { number, title }));
            }
            Err(e) => out.push(Err(e)),
        }
    }

    fn finalize_current(&mut self, out: &mut Vec<Result<ParserEvent, ParseError>>) {
        let Some(cur) = self.current.take() else {
            return;
        };
        if !cur.objective_emitted {
            if let Some(objective) = cur.objective {
                out.push(Ok(ParserEvent::TaskGoal {
                    index: cur.number,
                    objective,
                }));
            }
        }
        if let Some(deliverable) = cur.deliverable {
            out.push(Ok(ParserEvent::TaskDeliverable {
                index: cur.number,
                deliverable,
            }));
        }
        out.push(Ok(ParserEvent::TaskEnd(cur.number)));
    }
}

fn append_continuation(buf: &mut Option<String>, line: &str) {
    match buf {
        Some(existing) => {
            existing.push(' ');
            existing.push_str(line);
        }
        None => *buf = Some(line.to_owned()),
    }
}

/// `None` if `line` doesn't look like a task line at all (first byte isn't
/// an ASCII digit). `Some(Err(_))` if it looks like one but the leading
/// number fails to parse.
fn try_parse_task_line(line: &str) -> Option<Result<(u32, String), ParseError>> {
    if !line.as_bytes().first()?.is_ascii_digit() {
        return None;
    }
    let dot_pos = line.find('.')?;
    let (number_part, rest) = line.split_at(dot_pos);
    let title = rest[1..].trim().to_owned();
    match number_part.parse::<u32>() {
        Ok(number) => Some(Ok((number, title))),
        Err(_) => Some(Err(ParseError {
            line: line.to_owned(),
        })),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed_whole(input: &str) -> Vec<Result<ParserEvent, ParseError>> {
        let mut parser = Parser::new();
        let mut events = parser.feed(input.as_bytes());
        events.extend(parser.finalize());
        events
    }

    #[test]
    fn v5_dialect_full_run_produces_expected_sequence() {
        let input = "<final_answer>\nTodo: T\nSub-Todos:\n1. A\n\
                      - Objective: O\n- Deliverable: D\n2. B\n\
                      - Objective: O2\n- Deliverable: D2\n</final_answer>\n";
        let events: Vec<_> = feed_whole(input).into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                ParserEvent::RedefineTitle("T".to_owned()),
                ParserEvent::TaskStart { number: 1, title: "A".to_owned() },
                ParserEvent::TaskGoal { index: 1, objective: "O".to_owned() },
                ParserEvent::TaskDeliverable { index: 1, deliverable: "D".to_owned() },
                ParserEvent::TaskEnd(1),
                ParserEvent::TaskStart { number: 2, title: "B".to_owned() },
                ParserEvent::TaskGoal { index: 2, objective: "O2".to_owned() },
                ParserEvent::TaskDeliverable { index: 2, deliverable: "D2".to_owned() },
                ParserEvent::TaskEnd(2),
                ParserEvent::Complete,
            ]
        );
    }

    /// Property #2: from InSubTodos, a single task's lines produce exactly
    /// this sequence.
    #[test]
    fn single_task_from_sub_todos_produces_start_goal_deliverable_end_complete() {
        let input = "Sub-Todos:\n1. Alpha\n- Objective: O1\n- Deliverable: D1\n</final_answer>\n";
        let events: Vec<_> = feed_whole(input).into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                ParserEvent::TaskStart { number: 1, title: "Alpha".to_owned() },
                ParserEvent::TaskGoal { index: 1, objective: "O1".to_owned() },
                ParserEvent::TaskDeliverable { index: 1, deliverable: "D1".to_owned() },
                ParserEvent::TaskEnd(1),
                ParserEvent::Complete,
            ]
        );
    }

    #[test]
    fn v1_dialect_skips_final_answer_preamble_and_never_redefines_title() {
        let input = "Sub-Todos:\n1. Only\n- Objective: O\n- Deliverable: D\n</final_answer>\n";
        let events: Vec<_> = feed_whole(input).into_iter().map(|e| e.unwrap()).collect();
        assert!(!events.iter().any(|e| matches!(e, ParserEvent::RedefineTitle(_))));
    }

    #[test]
    fn malformed_task_number_is_recoverable() {
        let mut parser = Parser::new();
        let mut events = parser.feed(b"Sub-Todos:\n99999999999999999999. Bad\n1. Good\n- Objective: O\n- Deliverable: D\n</final_answer>\n");
        events.extend(parser.finalize());

        let errors: Vec<_> = events.iter().filter(|e| e.is_err()).collect();
        assert_eq!(errors.len(), 1);
        let oks: Vec<_> = events.into_iter().filter_map(Result::ok).collect();
        assert_eq!(oks[0], ParserEvent::TaskStart { number: 1, title: "Good".to_owned() });
    }

    #[test]
    fn whitespace_only_lines_are_ignored_in_every_state() {
        let input = "<final_answer>\n   \nTodo: T\n\t\nSub-Todos:\n\n1. A\n- Objective: O\n\n- Deliverable: D\n</final_answer>\n";
        let events = feed_whole(input);
        assert!(events.iter().all(Result::is_ok));
    }

    /// Property #1: chunking the same input arbitrarily yields the same
    /// event sequence as feeding it all at once.
    #[test]
    fn chunking_is_irrelevant_to_the_output_sequence() {
        let input = "<final_answer>\nTodo: T\nSub-Todos:\n1. A\n\
                      - Objective: O\n- Deliverable: D\n</final_answer>\n";
        let whole = feed_whole(input);

        let mut parser = Parser::new();
        let mut chunked = Vec::new();
        for byte in input.as_bytes() {
            chunked.extend(parser.feed(&[*byte]));
        }
        chunked.extend(parser.finalize());

        assert_eq!(whole, chunked);
    }
}
