use ariadne::{Color, Label, Report, ReportKind, Source};
use chumsky::prelude::*;
use itertools::Itertools;

/// One `p(vars|given)` term of a factorization.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Term {
    pub(crate) vars: Vec<String>,
    pub(crate) given: Vec<String>,
}

impl Term {
    /// Canonical name, e.g. `p(v1|h1)`.
    pub(crate) fn name(&self) -> String {
        if self.given.is_empty() {
            format!("p({})", self.vars.iter().join(","))
        } else {
            format!(
                "p({}|{})",
                self.vars.iter().join(","),
                self.given.iter().join(",")
            )
        }
    }
    /// Every variable of the term, both sides of the bar, without duplicates.
    pub(crate) fn scope(&self) -> impl Iterator<Item = &str> {
        self.vars
            .iter()
            .chain(self.given.iter())
            .map(String::as_str)
            .unique()
    }
}

fn parser() -> impl Parser<char, Vec<Term>, Error = Simple<char>> {
    let pad = || text::whitespace::<char, Simple<char>>();
    let op = move |c: char| just(c).delimited_by(pad(), pad());
    let ident = move || {
        pad()
            .ignore_then(text::ident::<char, Simple<char>>())
            .then_ignore(pad())
    };
    let names = move || ident().separated_by(op(',')).at_least(1);
    let term = pad()
        .ignore_then(just('p'))
        .ignore_then(
            names()
                .then(op('|').ignore_then(names()).or_not())
                .delimited_by(op('('), op(')')),
        )
        .map(|(vars, given)| Term {
            vars,
            given: given.unwrap_or_default(),
        });
    term.repeated().then_ignore(pad()).then_ignore(end())
}

/// Parse a factorization such as `p(a)p(b|a)`. On failure, the error is a rendered report
/// pointing at the offending input.
pub(crate) fn parse(src: &str) -> Result<Vec<Term>, String> {
    parser().parse(src).map_err(|errs| {
        let mut err_str = Vec::new();
        for e in errs {
            let msg = match e.reason() {
                chumsky::error::SimpleReason::Unclosed { delimiter, .. } => {
                    format!("Unclosed delimiter {}", delimiter)
                }
                chumsky::error::SimpleReason::Custom(msg) => msg.clone(),
                _ => format!(
                    "Unexpected {}, expected {}",
                    e.found()
                        .map(|c| format!("token {}", c))
                        .unwrap_or_else(|| "end of input".to_string()),
                    if e.expected().len() == 0 {
                        "something else".to_string()
                    } else {
                        e.expected()
                            .map(|expected| match expected {
                                Some(expected) => expected.to_string(),
                                None => "end of input".to_string(),
                            })
                            .join(", ")
                    },
                ),
            };
            let report = Report::build(ReportKind::Error, (), e.span().start)
                .with_config(ariadne::Config::default().with_color(false))
                .with_message(&msg)
                .with_label(
                    Label::new(e.span())
                        .with_message("here")
                        .with_color(Color::Red),
                )
                .finish();
            if report.write(Source::from(src), &mut err_str).is_err() {
                err_str.extend_from_slice(msg.as_bytes());
            }
        }
        String::from_utf8_lossy(&err_str).into_owned()
    })
}
