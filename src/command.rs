//! Reference driver for the builder API: splits a raw line into words and
//! operators and feeds them to an [`InputLine`]. Not a shell grammar.

use thiserror::Error;

use crate::line::InputLine;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("expected a path after '{0}'")]
    MissingRedirectTarget(char),

    #[error("empty command near '{0}'")]
    EmptyCommand(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Word(&'a str),
    /// Includes both delimiters.
    Quoted(&'a str),
    Op(char),
}

const OPERATORS: [char; 5] = ['|', ';', '&', '<', '>'];

fn tokenize(input: &str) -> Result<Vec<Token<'_>>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if OPERATORS.contains(&c) {
            chars.next();
            tokens.push(Token::Op(c));
        } else if c == '"' || c == '\'' {
            chars.next();
            let end = chars
                .find(|&(_, ch)| ch == c)
                .map(|(i, ch)| i + ch.len_utf8())
                .ok_or(ParseError::UnterminatedQuote)?;
            tokens.push(Token::Quoted(&input[start..end]));
        } else {
            let mut end = input.len();
            while let Some(&(i, ch)) = chars.peek() {
                if ch.is_whitespace() || OPERATORS.contains(&ch) || ch == '"' || ch == '\'' {
                    end = i;
                    break;
                }
                chars.next();
            }
            tokens.push(Token::Word(&input[start..end]));
        }
    }

    Ok(tokens)
}

/// Appends everything in `input` to `line`. On error the line is left
/// partially built; the caller resets it.
pub fn parse_line(input: &str, line: &mut InputLine) -> Result<(), ParseError> {
    let tokens = tokenize(input)?;
    let mut open = false;
    let mut iter = tokens.into_iter();

    while let Some(token) = iter.next() {
        match token {
            Token::Word("exit") if !open => {
                line.request_exit();
                return Ok(());
            }
            Token::Word(word) => {
                open_statement(line, &mut open);
                line.append_argument(word, false);
            }
            Token::Quoted(text) => {
                open_statement(line, &mut open);
                line.append_argument(text, true);
            }
            Token::Op('|') => {
                require_stage(line, open, "|")?;
                line.append_stage();
            }
            Token::Op(op @ (';' | '&')) => {
                require_stage(line, open, if op == '&' { "&" } else { ";" })?;
                if op == '&' {
                    if let Some(statement) = line.current_statement_mut() {
                        statement.set_background(true);
                    }
                }
                open = false;
            }
            Token::Op(op) => {
                let path = match iter.next() {
                    Some(Token::Word(word)) => word.to_string(),
                    Some(Token::Quoted(text)) => unquote(text).to_string(),
                    _ => return Err(ParseError::MissingRedirectTarget(op)),
                };
                open_statement(line, &mut open);
                if let Some(statement) = line.current_statement_mut() {
                    if op == '<' {
                        statement.set_input(path);
                    } else {
                        statement.set_output(path);
                    }
                }
            }
        }
    }

    if open {
        require_stage(line, open, "newline")?;
    }
    Ok(())
}

fn open_statement(line: &mut InputLine, open: &mut bool) {
    if !*open {
        line.append_statement(false);
        *open = true;
    }
}

fn require_stage(line: &InputLine, open: bool, near: &'static str) -> Result<(), ParseError> {
    let empty = !open
        || line
            .statements()
            .last()
            .map_or(true, |statement| statement.current_stage().argv().is_empty());
    if empty {
        return Err(ParseError::EmptyCommand(near));
    }
    Ok(())
}

fn unquote(text: &str) -> &str {
    &text[1..text.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> InputLine {
        let mut line = InputLine::new();
        parse_line(input, &mut line).unwrap();
        line
    }

    fn words(line: &InputLine, statement: usize, stage: usize) -> Vec<String> {
        line.statements()[statement].pipeline().stages()[stage]
            .argv()
            .iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn tokenizes_words_quotes_and_operators() {
        let tokens = tokenize("grep \"a b\"|wc -l>out").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("grep"),
                Token::Quoted("\"a b\""),
                Token::Op('|'),
                Token::Word("wc"),
                Token::Word("-l"),
                Token::Op('>'),
                Token::Word("out"),
            ]
        );
    }

    #[test]
    fn builds_pipeline_with_redirection() {
        let line = parse("sort < in.txt | uniq -c > 'out file' &");
        assert_eq!(line.len(), 1);
        let statement = &line.statements()[0];
        assert!(statement.background());
        assert_eq!(statement.input().unwrap().to_str(), Some("in.txt"));
        assert_eq!(statement.output().unwrap().to_str(), Some("out file"));
        assert_eq!(words(&line, 0, 0), vec!["sort"]);
        assert_eq!(words(&line, 0, 1), vec!["uniq", "-c"]);
    }

    #[test]
    fn separators_start_new_statements() {
        let line = parse("sleep 1 & echo 'hi there'; date");
        assert_eq!(line.len(), 3);
        assert!(line.statements()[0].background());
        assert!(!line.statements()[1].background());
        assert_eq!(words(&line, 1, 0), vec!["echo", "hi there"]);
        assert_eq!(words(&line, 2, 0), vec!["date"]);
    }

    #[test]
    fn exit_requests_exit_and_keeps_earlier_statements() {
        let line = parse("true; exit; false");
        assert!(line.exit_requested());
        assert_eq!(line.len(), 1);
    }

    #[test]
    fn empty_line_has_no_statements() {
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn rejects_empty_stages_and_bad_redirects() {
        let mut line = InputLine::new();
        assert_eq!(parse_line("| wc", &mut line), Err(ParseError::EmptyCommand("|")));
        line.start_new_line();
        assert_eq!(parse_line("ls |", &mut line), Err(ParseError::EmptyCommand("newline")));
        line.start_new_line();
        assert_eq!(
            parse_line("ls >", &mut line),
            Err(ParseError::MissingRedirectTarget('>'))
        );
        line.start_new_line();
        assert_eq!(parse_line("echo \"oops", &mut line), Err(ParseError::UnterminatedQuote));
    }
}
