use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use scopeline::{RawTheme, Registry, Theme, ThemeProvider};

/// Tokenizes a file with TextMate grammars and prints the tokens of each line
#[derive(Parser, Debug)]
#[command(name = "scopeline-cli")]
struct Args {
    /// Text file to tokenize
    input: PathBuf,

    /// Grammar JSON files. Grammars after the first one can be included or injected by it.
    #[arg(short, long, required = true)]
    grammar: Vec<PathBuf>,

    /// Scope name of the grammar to use instead of the first one given
    #[arg(short, long)]
    scope: Option<String>,

    /// VSCode theme JSON file, only used with `--binary`
    #[arg(short, long)]
    theme: Option<PathBuf>,

    /// Print the packed metadata of tokens instead of their scopes
    #[arg(short, long)]
    binary: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let theme: Arc<dyn ThemeProvider> = match &args.theme {
        Some(path) => Arc::new(RawTheme::from_json(&fs::read_to_string(path)?)?.compile()),
        None => Arc::new(Theme::empty()),
    };
    let registry = Registry::new(theme);

    let mut first_scope = None;
    for path in &args.grammar {
        let raw = scopeline::RawGrammar::from_json(&fs::read_to_string(path)?)?;
        first_scope.get_or_insert_with(|| raw.scope_name.clone());
        registry.add_grammar(raw)?;
    }
    let scope = args
        .scope
        .or(first_scope)
        .ok_or("no grammar given")?;
    let grammar = registry.grammar_for_scope(&scope)?;

    let content = fs::read_to_string(&args.input)?;
    let content = content.replace("\r\n", "\n");
    let mut state = None;
    for (line_idx, line) in content.lines().enumerate() {
        println!("line {line_idx}: {line:?}");
        if args.binary {
            let result = grammar.tokenize_line_binary(line, state.as_ref());
            for token in &result.tokens {
                println!("  {} {:?}", token.start, token.metadata);
            }
            state = Some(result.rule_stack);
        } else {
            let result = grammar.tokenize_line(line, state.as_ref());
            let chars: Vec<char> = line.chars().collect();
            for token in &result.tokens {
                let text: String = chars[token.span.clone()].iter().collect();
                println!(
                    "  [{}..{}] {text:?} {}",
                    token.span.start,
                    token.span.end,
                    token.scopes.join(" ")
                );
            }
            state = Some(result.rule_stack);
        }
    }

    Ok(())
}
