//! DOT (Graphviz) surface for causal graphs.
//!
//! Reads the subset of the DOT language used to write causal graphs by hand:
//!
//! ```text
//! digraph {
//!     treatment [label="Program signup"];
//!     U [observed="no"];
//!     pre_spend -> treatment -> post_spend;
//!     pre_spend -> post_spend;
//! }
//! ```
//!
//! Node and edge attributes are accepted and ignored, except
//! `observed="no"` (or `"false"`/`"0"`) which marks a latent variable.
//! `graph`, `node` and `edge` default-attribute statements are skipped.
//! Undirected graphs and subgraphs are rejected.

use lc_core::{Error, Result};

use crate::graph::CausalGraph;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Id(String),
    Arrow,
    UndirectedEdge,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Eq,
    Semi,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let mut at_line_start = true;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            at_line_start = true;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' && at_line_start {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        at_line_start = false;

        match c {
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(Error::Graph("unterminated /* comment in DOT source".into()));
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'>') => {
                out.push(Token::Arrow);
                i += 2;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                out.push(Token::UndirectedEdge);
                i += 2;
            }
            '{' => {
                out.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                out.push(Token::RBrace);
                i += 1;
            }
            '[' => {
                out.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                out.push(Token::RBracket);
                i += 1;
            }
            '=' => {
                out.push(Token::Eq);
                i += 1;
            }
            ';' => {
                out.push(Token::Semi);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(Error::Graph("unterminated string in DOT source".into()));
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if chars.get(i + 1) == Some(&'"') => {
                            s.push('"');
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                out.push(Token::Id(s));
            }
            c if is_id_char(c) => {
                let start = i;
                while i < chars.len() && is_id_char(chars[i]) {
                    i += 1;
                }
                out.push(Token::Id(chars[start..i].iter().collect()));
            }
            other => {
                return Err(Error::Graph(format!("unexpected character '{other}' in DOT source")));
            }
        }
    }
    Ok(out)
}

fn is_id_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nodes: Vec<(String, bool)>,
    edges: Vec<(String, String)>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => Err(Error::Graph(format!("expected {want:?} in DOT source, found {other:?}"))),
        }
    }

    fn id(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Id(s)) => Ok(s),
            other => {
                Err(Error::Graph(format!("expected identifier in DOT source, found {other:?}")))
            }
        }
    }

    fn header(&mut self) -> Result<()> {
        let mut kw = self.id()?;
        if kw.eq_ignore_ascii_case("strict") {
            kw = self.id()?;
        }
        if kw.eq_ignore_ascii_case("graph") {
            return Err(Error::Graph("undirected graphs cannot encode causal structure".into()));
        }
        if !kw.eq_ignore_ascii_case("digraph") {
            return Err(Error::Graph(format!("expected 'digraph', found '{kw}'")));
        }
        if matches!(self.peek(), Some(Token::Id(_))) {
            self.pos += 1;
        }
        self.expect(Token::LBrace)
    }

    /// `[k=v, k=v; ...]`, possibly repeated. Returns whether `observed` was
    /// set to a false value.
    fn attributes(&mut self) -> Result<bool> {
        let mut latent = false;
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            loop {
                match self.peek() {
                    Some(Token::RBracket) => {
                        self.pos += 1;
                        break;
                    }
                    Some(Token::Comma) | Some(Token::Semi) => self.pos += 1,
                    _ => {
                        let key = self.id()?;
                        self.expect(Token::Eq)?;
                        let value = self.id()?;
                        if key == "observed" {
                            let value = value.to_ascii_lowercase();
                            latent = matches!(value.as_str(), "no" | "false" | "0");
                        }
                    }
                }
            }
        }
        Ok(latent)
    }

    fn statements(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                None => return Err(Error::Graph("missing closing '}' in DOT source".into())),
                Some(Token::RBrace) => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(Token::Semi) => self.pos += 1,
                Some(Token::LBrace) => {
                    return Err(Error::Graph("subgraphs are not supported".into()));
                }
                Some(Token::Id(_)) => self.statement()?,
                Some(other) => {
                    return Err(Error::Graph(format!("unexpected token {other:?} in DOT source")));
                }
            }
        }
    }

    fn statement(&mut self) -> Result<()> {
        let first = self.id()?;

        if matches!(first.as_str(), "graph" | "node" | "edge")
            && self.peek() == Some(&Token::LBracket)
        {
            self.attributes()?;
            return Ok(());
        }
        if self.peek() == Some(&Token::Eq) {
            // graph-level `key = value`
            self.pos += 1;
            self.id()?;
            return Ok(());
        }

        let mut chain = vec![first];
        loop {
            match self.peek() {
                Some(Token::Arrow) => {
                    self.pos += 1;
                    chain.push(self.id()?);
                }
                Some(Token::UndirectedEdge) => {
                    return Err(Error::Graph("undirected edge '--' in a causal graph".into()));
                }
                _ => break,
            }
        }
        let latent = self.attributes()?;

        if chain.len() == 1 {
            let name = chain.pop().unwrap_or_default();
            self.nodes.push((name, !latent));
        } else {
            for pair in chain.windows(2) {
                self.edges.push((pair[0].clone(), pair[1].clone()));
            }
        }
        Ok(())
    }
}

impl CausalGraph {
    /// Parse a DOT digraph and designate its treatment and outcome.
    pub fn from_dot(src: &str, treatment: &str, outcome: &str) -> Result<Self> {
        let mut p = Parser { tokens: tokenize(src)?, pos: 0, nodes: Vec::new(), edges: Vec::new() };
        p.header()?;
        p.statements()?;
        if p.pos < p.tokens.len() {
            return Err(Error::Graph("trailing tokens after closing '}' in DOT source".into()));
        }
        CausalGraph::from_parts(p.nodes, p.edges, treatment, outcome)
    }

    /// Render as a DOT digraph; latent variables carry `observed="no"`.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for v in self.variables() {
            if v.observed {
                out.push_str(&format!("    {};\n", quote(&v.name)));
            } else {
                out.push_str(&format!("    {} [observed=\"no\"];\n", quote(&v.name)));
            }
        }
        for (a, b) in self.edges() {
            out.push_str(&format!("    {} -> {};\n", quote(a), quote(b)));
        }
        out.push('}');
        out.push('\n');
        out
    }
}

fn quote(name: &str) -> String {
    let plain = name.chars().all(is_id_char) && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain { name.to_string() } else { format!("\"{}\"", name.replace('"', "\\\"")) }
}
