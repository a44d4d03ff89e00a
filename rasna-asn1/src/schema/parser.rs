//! Parser for the textual ASN.1 module syntax.

use super::{Schema, SchemaNodeId, SchemaType, TagMode, TagOverride};
use crate::error::{Asn1Error, Result};
use crate::tag::TagClass;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(u32),
    Assign, // ::=
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
}

struct Lexer {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

fn syntax(line: usize, reason: &'static str) -> Asn1Error {
    Asn1Error::SchemaSyntax { line, reason }
}

impl Lexer {
    fn tokenize(text: &str) -> Result<Lexer> {
        let mut tokens = Vec::new();
        let mut chars = text.chars().peekable();
        let mut line = 1usize;

        while let Some(&c) = chars.peek() {
            match c {
                '\n' => {
                    line += 1;
                    chars.next();
                }
                c if c.is_whitespace() => {
                    chars.next();
                }
                '-' => {
                    chars.next();
                    if chars.peek() == Some(&'-') {
                        // comment until end of line
                        for c in chars.by_ref() {
                            if c == '\n' {
                                line += 1;
                                break;
                            }
                        }
                    } else {
                        return Err(syntax(line, "stray `-`"));
                    }
                }
                ':' => {
                    chars.next();
                    if chars.next() != Some(':') || chars.next() != Some('=') {
                        return Err(syntax(line, "expected `::=`"));
                    }
                    tokens.push((Token::Assign, line));
                }
                '{' => {
                    chars.next();
                    tokens.push((Token::LBrace, line));
                }
                '}' => {
                    chars.next();
                    tokens.push((Token::RBrace, line));
                }
                '[' => {
                    chars.next();
                    tokens.push((Token::LBracket, line));
                }
                ']' => {
                    chars.next();
                    tokens.push((Token::RBracket, line));
                }
                ',' => {
                    chars.next();
                    tokens.push((Token::Comma, line));
                }
                '(' => {
                    // subtype constraints are tolerated and skipped
                    let mut depth = 0usize;
                    for c in chars.by_ref() {
                        match c {
                            '(' => depth += 1,
                            ')' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            '\n' => line += 1,
                            _ => {}
                        }
                    }
                    if depth != 0 {
                        return Err(syntax(line, "unbalanced constraint parentheses"));
                    }
                }
                c if c.is_ascii_digit() => {
                    let mut n: u32 = 0;
                    while let Some(&d) = chars.peek() {
                        if let Some(v) = d.to_digit(10) {
                            n = n * 10 + v;
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push((Token::Number(n), line));
                }
                c if c.is_ascii_alphabetic() => {
                    let mut ident = String::new();
                    while let Some(&d) = chars.peek() {
                        if d.is_ascii_alphanumeric() || d == '-' {
                            ident.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push((Token::Ident(ident), line));
                }
                _ => return Err(syntax(line, "unexpected character")),
            }
        }

        Ok(Lexer { tokens, pos: 0 })
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|(_, line)| *line)
            .unwrap_or(1)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token, reason: &'static str) -> Result<()> {
        let line = self.line();
        match self.next() {
            Some(t) if t == token => Ok(()),
            _ => Err(syntax(line, reason)),
        }
    }

    fn accept_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next_ident(&mut self, reason: &'static str) -> Result<String> {
        let line = self.line();
        match self.next() {
            Some(Token::Ident(w)) => Ok(w),
            _ => Err(syntax(line, reason)),
        }
    }
}

pub(super) fn parse_module(text: &str) -> Result<Schema> {
    let mut lex = Lexer::tokenize(text)?;

    let name = parse_header(&mut lex)?;
    let mut schema = Schema::empty(name);

    loop {
        match lex.peek() {
            None => break,
            Some(Token::Ident(w)) if w == "END" => {
                lex.next();
                break;
            }
            _ => {}
        }
        let line = lex.line();
        let name = lex.next_ident("expected assignment name")?;
        lex.expect(Token::Assign, "expected `::=` after assignment name")?;
        let id = parse_type(&mut lex, &mut schema)?;
        if schema.node(id).name.is_none() {
            schema.node_mut(id).name = Some(name.clone());
        }
        if schema.assignment(&name).is_some() {
            return Err(syntax(line, "duplicate assignment"));
        }
        schema.add_assignment(name, id);
    }

    Ok(schema)
}

/// `Name [DEFINITIONS [EXPLICIT|IMPLICIT TAGS]] ::= BEGIN`. The header is
/// optional; a bare list of assignments is accepted too.
fn parse_header(lex: &mut Lexer) -> Result<String> {
    if let Some(Token::Ident(name)) = lex.peek().cloned() {
        let mut ahead = 1;
        while matches!(
            lex.peek_at(ahead),
            Some(Token::Ident(w)) if matches!(w.as_str(), "DEFINITIONS" | "EXPLICIT" | "IMPLICIT" | "TAGS")
        ) {
            ahead += 1;
        }
        if lex.peek_at(ahead) == Some(&Token::Assign)
            && matches!(lex.peek_at(ahead + 1), Some(Token::Ident(w)) if w == "BEGIN")
        {
            lex.pos += ahead + 2;
            return Ok(name);
        }
    }
    Ok(String::new())
}

fn parse_type(lex: &mut Lexer, schema: &mut Schema) -> Result<SchemaNodeId> {
    let line = lex.line();
    let word = lex.next_ident("expected a type")?;

    let ty = match word.as_str() {
        "SEQUENCE" | "SET" => {
            let of = lex.accept_ident("OF");
            let constructed = if word == "SEQUENCE" {
                if of {
                    SchemaType::SequenceOf
                } else {
                    SchemaType::Sequence
                }
            } else if of {
                SchemaType::SetOf
            } else {
                SchemaType::Set
            };
            let id = schema.new_node(constructed);
            if of {
                let elem = parse_type(lex, schema)?;
                schema.node_mut(id).child = Some(elem);
            } else {
                parse_fields(lex, schema, id)?;
            }
            return Ok(id);
        }
        "CHOICE" => {
            let id = schema.new_node(SchemaType::Choice);
            parse_fields(lex, schema, id)?;
            return Ok(id);
        }
        "INTEGER" => SchemaType::Integer,
        "BOOLEAN" => SchemaType::Boolean,
        "NULL" => SchemaType::Null,
        "OBJECT" => {
            if !lex.accept_ident("IDENTIFIER") {
                return Err(syntax(line, "expected `OBJECT IDENTIFIER`"));
            }
            SchemaType::Oid
        }
        "BIT" => {
            if !lex.accept_ident("STRING") {
                return Err(syntax(line, "expected `BIT STRING`"));
            }
            SchemaType::BitString
        }
        "OCTET" => {
            if !lex.accept_ident("STRING") {
                return Err(syntax(line, "expected `OCTET STRING`"));
            }
            SchemaType::OctetString
        }
        "UTF8String" => SchemaType::Utf8String,
        "PrintableString" => SchemaType::PrintableString,
        "IA5String" => SchemaType::Ia5String,
        "UTCTime" => SchemaType::UtcTime,
        "GeneralizedTime" => SchemaType::GeneralizedTime,
        "ANY" => {
            if lex.accept_ident("DEFINED") {
                if !lex.accept_ident("BY") {
                    return Err(syntax(line, "expected `ANY DEFINED BY name`"));
                }
                lex.next_ident("expected field name after `ANY DEFINED BY`")?;
            }
            SchemaType::Any
        }
        _ => {
            if !word.starts_with(|c: char| c.is_ascii_uppercase()) {
                return Err(syntax(line, "expected a type name"));
            }
            let id = schema.new_node(SchemaType::TypeRef);
            schema.node_mut(id).reference = Some(word);
            return Ok(id);
        }
    };

    Ok(schema.new_node(ty))
}

fn parse_fields(lex: &mut Lexer, schema: &mut Schema, parent: SchemaNodeId) -> Result<()> {
    lex.expect(Token::LBrace, "expected `{`")?;

    let mut prev: Option<SchemaNodeId> = None;
    loop {
        let field = parse_field(lex, schema)?;
        match prev {
            None => schema.node_mut(parent).child = Some(field),
            Some(p) => schema.node_mut(p).sibling = Some(field),
        }
        prev = Some(field);

        let line = lex.line();
        match lex.next() {
            Some(Token::Comma) => continue,
            Some(Token::RBrace) => return Ok(()),
            _ => return Err(syntax(line, "expected `,` or `}` after field")),
        }
    }
}

fn parse_field(lex: &mut Lexer, schema: &mut Schema) -> Result<SchemaNodeId> {
    let line = lex.line();
    let name = match lex.next() {
        Some(Token::Ident(w)) if w.starts_with(|c: char| c.is_ascii_lowercase()) => w,
        _ => return Err(syntax(line, "expected field name")),
    };

    let tag = parse_tag_override(lex)?;
    let id = parse_type(lex, schema)?;

    let node = schema.node_mut(id);
    node.name = Some(name);
    node.tag = tag;

    if lex.accept_ident("OPTIONAL") {
        schema.node_mut(id).optional = true;
    } else if lex.accept_ident("DEFAULT") {
        schema.node_mut(id).has_default = true;
        // default value: single token or `{ ... }` group
        let line = lex.line();
        match lex.next() {
            Some(Token::LBrace) => {
                let mut depth = 1usize;
                while depth > 0 {
                    match lex.next() {
                        Some(Token::LBrace) => depth += 1,
                        Some(Token::RBrace) => depth -= 1,
                        Some(_) => {}
                        None => return Err(syntax(line, "unterminated DEFAULT value")),
                    }
                }
            }
            Some(Token::Ident(_)) | Some(Token::Number(_)) => {}
            _ => return Err(syntax(line, "expected DEFAULT value")),
        }
    }

    Ok(id)
}

fn parse_tag_override(lex: &mut Lexer) -> Result<Option<TagOverride>> {
    if lex.peek() != Some(&Token::LBracket) {
        return Ok(None);
    }
    lex.next();
    let line = lex.line();

    let class = if lex.accept_ident("APPLICATION") {
        TagClass::Application
    } else if lex.accept_ident("PRIVATE") {
        TagClass::Private
    } else if lex.accept_ident("UNIVERSAL") {
        TagClass::Universal
    } else {
        TagClass::Context
    };

    let number = match lex.next() {
        Some(Token::Number(n)) => n,
        _ => return Err(syntax(line, "expected tag number")),
    };
    lex.expect(Token::RBracket, "expected `]` after tag number")?;

    // Tagging mode defaults to EXPLICIT, matching the module headers the
    // engine ships with.
    let mode = if lex.accept_ident("IMPLICIT") {
        TagMode::Implicit
    } else {
        lex.accept_ident("EXPLICIT");
        TagMode::Explicit
    };

    Ok(Some(TagOverride {
        class,
        number,
        mode,
    }))
}
