//! Recognising escape sequences in locally typed input.
//!
//! An escape is only recognised right after a line terminator: the escape
//! character followed by a command byte.

pub const DEFAULT_ESCAPE: u8 = b'`';

/// Help text for the `?` command, with terminal line endings. `{}` stands for
/// the escape character.
const HELP: &str = "Supported escape sequences:\r\n\
{}. - return the process to its original terminal\r\n\
{}d - return the process to its original terminal\r\n\
{}? - this message\r\n\
{}{} - send the escape character by typing it twice\r\n\
(Note that escapes are only recognized immediately after newline.)\r\n";

pub fn help_text(escape: u8) -> String {
    HELP.replace("{}", &char::from(escape).to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscapeState {
    #[default]
    Idle,
    AfterNewline,
    AfterEscapeChar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    /// Detach requested: only bytes before this index are to be forwarded.
    pub split: Option<usize>,
    /// The help command was typed.
    pub help: bool,
}

#[derive(Debug, Clone)]
pub struct EscapeParser {
    escape: u8,
    state: EscapeState,
}

impl Default for EscapeParser {
    fn default() -> Self {
        Self::new(DEFAULT_ESCAPE)
    }
}

fn is_line_terminator(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

impl EscapeParser {
    pub fn new(escape: u8) -> Self {
        Self { escape, state: EscapeState::Idle }
    }

    pub fn escape(&self) -> u8 {
        self.escape
    }

    pub fn state(&self) -> EscapeState {
        self.state
    }

    /// Scan `buf`, rewriting it into the bytes to forward.
    ///
    /// Scanning stops at a detach command; everything from the split point on
    /// is left in `buf` unexamined.
    pub fn scan(&mut self, buf: &mut Vec<u8>) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut i = 0;

        while i < buf.len() {
            let byte = buf[i];
            match self.state {
                EscapeState::Idle => {
                    if is_line_terminator(byte) {
                        self.state = EscapeState::AfterNewline;
                    }
                    i += 1;
                }
                EscapeState::AfterNewline => {
                    if byte == self.escape {
                        buf.remove(i);
                        self.state = EscapeState::AfterEscapeChar;
                    } else {
                        self.state = EscapeState::Idle;
                        i += 1;
                    }
                }
                EscapeState::AfterEscapeChar => {
                    self.state = EscapeState::Idle;
                    match byte {
                        b'.' | b'd' => {
                            outcome.split = Some(i);
                            return outcome;
                        }
                        b'?' => {
                            buf.remove(i);
                            outcome.help = true;
                        }
                        _ if byte == self.escape => i += 1,
                        _ => {
                            buf.insert(i, self.escape);
                            i += 2;
                        }
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(parser: &mut EscapeParser, input: &[u8]) -> (Vec<u8>, ScanOutcome) {
        let mut buf = input.to_vec();
        let outcome = parser.scan(&mut buf);
        (buf, outcome)
    }

    #[test]
    fn dot_after_newline_requests_detach() {
        let mut parser = EscapeParser::default();
        let (buf, outcome) = scan(&mut parser, b"hello\n`.world");

        let split = outcome.split.unwrap();
        assert_eq!(&buf[..split], b"hello\n");
        assert_eq!(&buf[split..], b".world");
        assert!(!outcome.help);
    }

    #[test]
    fn d_is_also_a_detach_command() {
        let mut parser = EscapeParser::default();
        let (_, outcome) = scan(&mut parser, b"ls\r`d");
        assert_eq!(outcome.split, Some(3));
    }

    #[test]
    fn doubled_escape_is_a_literal() {
        let mut parser = EscapeParser::default();
        let (buf, outcome) = scan(&mut parser, b"hello\n``world");
        assert_eq!(buf, b"hello\n`world");
        assert_eq!(outcome, ScanOutcome::default());
    }

    #[test]
    fn unknown_command_is_forwarded_verbatim() {
        let mut parser = EscapeParser::default();
        let (buf, outcome) = scan(&mut parser, b"hello\n`Xworld");
        assert_eq!(buf, b"hello\n`Xworld");
        assert_eq!(outcome.split, None);
    }

    #[test]
    fn question_mark_asks_for_help() {
        let mut parser = EscapeParser::default();
        let (buf, outcome) = scan(&mut parser, b"\n`?x");
        assert_eq!(buf, b"\nx");
        assert!(outcome.help);
        assert_eq!(outcome.split, None);
    }

    #[test]
    fn escape_outside_line_start_is_plain_text() {
        let mut parser = EscapeParser::default();
        let (buf, outcome) = scan(&mut parser, b"echo `.`");
        assert_eq!(buf, b"echo `.`");
        assert_eq!(outcome.split, None);
        assert_eq!(parser.state(), EscapeState::Idle);
    }

    #[test]
    fn state_carries_across_chunks() {
        let mut parser = EscapeParser::default();

        let (buf, _) = scan(&mut parser, b"hello\n");
        assert_eq!(buf, b"hello\n");
        assert_eq!(parser.state(), EscapeState::AfterNewline);

        let (buf, _) = scan(&mut parser, b"`");
        assert!(buf.is_empty());
        assert_eq!(parser.state(), EscapeState::AfterEscapeChar);

        let (buf, outcome) = scan(&mut parser, b".");
        assert_eq!(outcome.split, Some(0));
        assert_eq!(buf, b".");
    }

    #[test]
    fn unknown_command_in_next_chunk_gets_escape_back() {
        let mut parser = EscapeParser::default();
        scan(&mut parser, b"\n`");
        let (buf, _) = scan(&mut parser, b"ls");
        assert_eq!(buf, b"`ls");
    }

    #[test]
    fn custom_escape_character() {
        let mut parser = EscapeParser::new(b'~');
        let (buf, outcome) = scan(&mut parser, b"a\n`.b\n~.");
        assert_eq!(outcome.split, Some(6));
        assert_eq!(&buf[..6], b"a\n`.b\n");
        assert!(help_text(b'~').contains("~d - return"));
    }
}
