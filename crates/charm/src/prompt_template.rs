use serde::Serialize;
use tera::{Context, Error as TeraError, Tera};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const FORMATTER_TEMPLATE: &str = include_str!("prompts/formatter.md");

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

#[derive(Debug, Serialize)]
pub struct PinnedContext<'a> {
    pub title: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
struct SystemContext<'a> {
    date: String,
    servers: Vec<&'a str>,
    pinned: Option<PinnedContext<'a>>,
}

pub fn system_prompt(
    servers: Vec<&str>,
    pinned: Option<PinnedContext<'_>>,
) -> Result<String, TeraError> {
    let context = SystemContext {
        date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
        servers,
        pinned,
    };
    load_prompt(SYSTEM_TEMPLATE, &context)
}

#[derive(Debug, Serialize)]
struct FormatterContext<'a> {
    tool: &'a str,
    has_bibliography: bool,
}

pub fn formatter_prompt(tool: &str, has_bibliography: bool) -> Result<String, TeraError> {
    load_prompt(
        FORMATTER_TEMPLATE,
        &FormatterContext {
            tool,
            has_bibliography,
        },
    )
}
