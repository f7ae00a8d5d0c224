//! Command registry.
//!
//! Commands are declared with a compact syntax:
//!
//! ```text
//! config/set <key:string> [value:text]
//! └──┬───┘  └──────┬─────┘└─────┬─────┘
//!  path     required arg   optional arg
//! ```
//!
//! Every path segment before the last one names an existing parent command:
//! the first segment is looked up across the whole runtime and each later one
//! among the children of the previous. Argument kinds are `string` (default),
//! `number`, `integer`, `boolean` and `text` (the rest of the input). A `...`
//! prefix makes the last argument variadic.
//!
//! Options are declared one per [`CommandDecl::option`] call, as a short
//! flag plus an argument: `-l <lines:integer>` or `-c [clean:boolean]`.
//! Input may use the short flag or `--name`, with the value in the next word
//! or after `=`. Boolean options take no value. A bare `--` ends option
//! parsing.
//!
//! Commands are stored on the context that declared them and linked into
//! their parent's children. The disposer returned by the declaring context
//! undoes both.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, trace};

use crate::context::{Context, ContextId};
use crate::error::{BoxError, ContextError, ContextResult};
use crate::event::{Payload, names};
use crate::filter::{Filter, Role};
use crate::session::{Session, SessionRef};

/// What a command action returns: an optional reply.
pub type ActionResult = Result<Option<String>, BoxError>;

pub type ActionFn = Arc<dyn Fn(Invocation) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Everything an action gets to see.
pub struct Invocation {
    /// The context the command was declared on.
    pub context: Context,
    pub session: SessionRef,
    pub command: Arc<Command>,
    /// Parsed arguments, one per declaration. Missing optionals are `null`.
    pub args: Vec<Value>,
    /// Options given on the input, keyed by name.
    pub options: Map<String, Value>,
}

impl Invocation {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index).filter(|v| !v.is_null())
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.arg(index).and_then(Value::as_str)
    }

    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    /// Whether boolean option `name` was given and not set to false.
    pub fn flag(&self, name: &str) -> bool {
        self.option(name).and_then(Value::as_bool).unwrap_or(false)
    }
}

// =============================================================================
// Argument declarations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    /// Swallows the rest of the input as one string.
    Text,
}

impl FromStr for ArgKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "string" => Ok(ArgKind::String),
            "number" => Ok(ArgKind::Number),
            "integer" | "int" => Ok(ArgKind::Integer),
            "boolean" | "bool" => Ok(ArgKind::Boolean),
            "text" => Ok(ArgKind::Text),
            other => Err(format!("unknown argument type '{other}'")),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArgKind::String => "string",
            ArgKind::Number => "number",
            ArgKind::Integer => "integer",
            ArgKind::Boolean => "boolean",
            ArgKind::Text => "text",
        };
        f.write_str(s)
    }
}

/// One declared argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDecl {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
    pub variadic: bool,
}

impl ArgDecl {
    fn parse(token: &str) -> Result<Self, String> {
        let (required, inner) = if let Some(inner) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            (true, inner)
        } else if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            (false, inner)
        } else {
            return Err(format!("'{token}' is neither <required> nor [optional]"));
        };
        let (variadic, inner) = match inner.strip_prefix("...") {
            Some(rest) => (true, rest),
            None => (false, inner),
        };
        let (name, kind) = inner.split_once(':').unwrap_or((inner, ""));
        if name.is_empty() {
            return Err(format!("'{token}' has no name"));
        }
        Ok(Self {
            name: name.to_string(),
            kind: kind.parse()?,
            required,
            variadic,
        })
    }

    fn convert(&self, raw: &str) -> Result<Value, String> {
        match self.kind {
            ArgKind::String | ArgKind::Text => Ok(Value::String(raw.to_string())),
            ArgKind::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("<{}> expects an integer, got '{raw}'", self.name)),
            ArgKind::Number => raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("<{}> expects a number, got '{raw}'", self.name)),
            ArgKind::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("<{}> expects a boolean, got '{raw}'", self.name)),
            },
        }
    }
}

impl fmt::Display for ArgDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, close) = if self.required { ('<', '>') } else { ('[', ']') };
        let dots = if self.variadic { "..." } else { "" };
        write!(f, "{open}{dots}{}:{}{close}", self.name, self.kind)
    }
}

/// One declared option, e.g. `-c [clean:boolean]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDecl {
    pub short: Option<char>,
    /// Name and kind. Options are never required, and every non-boolean
    /// option takes a value whichever brackets it was declared with.
    pub arg: ArgDecl,
}

impl OptionDecl {
    /// Parses `-x <name:kind>`, `-x [name:kind]`, `-x` or `--name[:kind]`.
    ///
    /// Words after the option are ignored, so a trailing description is
    /// allowed. A bare flag is a boolean named after itself.
    pub fn parse(decl: &str) -> Result<Self, String> {
        let mut tokens = decl.split_whitespace();
        let flag = tokens.next().ok_or_else(|| "empty option".to_string())?;
        let next = tokens
            .next()
            .filter(|t| t.starts_with('<') || t.starts_with('['));

        let (short, arg) = if let Some(long) = flag.strip_prefix("--") {
            let (name, kind) = long.split_once(':').unwrap_or((long, "boolean"));
            if name.is_empty() || next.is_some() {
                return Err(format!("'{decl}' is not a valid option"));
            }
            let arg = ArgDecl {
                name: name.to_string(),
                kind: kind.parse()?,
                required: false,
                variadic: false,
            };
            (None, arg)
        } else {
            let mut chars = flag.strip_prefix('-').unwrap_or_default().chars();
            let short = match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => c,
                _ => return Err(format!("'{flag}' is not a flag like -c or --clean")),
            };
            let arg = match next {
                Some(token) => ArgDecl::parse(token)?,
                None => ArgDecl {
                    name: short.to_string(),
                    kind: ArgKind::Boolean,
                    required: false,
                    variadic: false,
                },
            };
            (Some(short), arg)
        };
        if arg.variadic || arg.kind == ArgKind::Text {
            return Err(format!("option '{flag}' cannot take the rest of the input"));
        }
        Ok(Self { short, arg })
    }

    pub fn name(&self) -> &str {
        &self.arg.name
    }
}

impl fmt::Display for OptionDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.short {
            Some(short) => write!(f, "-{short} {}", self.arg),
            None => write!(f, "--{}:{}", self.arg.name, self.arg.kind),
        }
    }
}

/// Pulls declared options out of `tokens`, returning them along with the
/// words left for positional arguments.
///
/// A word like `-5` that names no declared short flag stays positional.
pub fn parse_option_values(
    decls: &[OptionDecl],
    tokens: &[String],
) -> Result<(Map<String, Value>, Vec<String>), String> {
    let mut options = Map::new();
    let mut positional = Vec::new();
    let mut words = tokens.iter();

    while let Some(word) = words.next() {
        if word == "--" {
            positional.extend(words.by_ref().cloned());
            break;
        }

        let (decl, inline) = if let Some(long) = word.strip_prefix("--") {
            let (name, inline) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            };
            let decl = decls
                .iter()
                .find(|d| d.name() == name)
                .ok_or_else(|| format!("unknown option '--{name}'"))?;
            (decl, inline)
        } else if let Some(short) = word.strip_prefix('-') {
            let (flag, inline) = match short.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (short, None),
            };
            let mut chars = flag.chars();
            let found = match (chars.next(), chars.next()) {
                (Some(c), None) => decls.iter().find(|d| d.short == Some(c)),
                _ => None,
            };
            match found {
                Some(decl) => (decl, inline),
                None => {
                    positional.push(word.clone());
                    continue;
                }
            }
        } else {
            positional.push(word.clone());
            continue;
        };

        let value = match inline {
            Some(raw) => decl.arg.convert(raw)?,
            None if decl.arg.kind == ArgKind::Boolean => Value::Bool(true),
            None => {
                let raw = words
                    .next()
                    .ok_or_else(|| format!("option '{word}' expects a value"))?;
                decl.arg.convert(raw)?
            }
        };
        options.insert(decl.name().to_string(), value);
    }

    Ok((options, positional))
}

/// The `/`-joined path named by a declaration, with arguments and empty
/// segments dropped: `"admin//kick <user:integer>"` becomes `"admin/kick"`.
pub fn command_path(decl: &str) -> String {
    decl.split_whitespace()
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parses the argument part of a declaration.
pub fn parse_arg_decls<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Result<Vec<ArgDecl>, String> {
    let mut out: Vec<ArgDecl> = Vec::new();
    for token in tokens {
        if out.last().is_some_and(|prev| prev.variadic || prev.kind == ArgKind::Text) {
            return Err(format!("'{token}' follows an argument that takes the rest of the input"));
        }
        let arg = ArgDecl::parse(token)?;
        if arg.required && out.last().is_some_and(|prev| !prev.required) {
            return Err(format!("required '{token}' follows an optional argument"));
        }
        out.push(arg);
    }
    Ok(out)
}

/// Matches input tokens against declarations.
pub fn parse_arg_values(decls: &[ArgDecl], tokens: &[String]) -> Result<Vec<Value>, String> {
    let mut values = Vec::with_capacity(decls.len());
    let mut rest = tokens;
    for decl in decls {
        if decl.kind == ArgKind::Text {
            if rest.is_empty() && decl.required {
                return Err(format!("missing argument <{}>", decl.name));
            }
            values.push(match rest.is_empty() {
                true => Value::Null,
                false => Value::String(rest.join(" ")),
            });
            rest = &[];
            continue;
        }
        if decl.variadic {
            if rest.is_empty() && decl.required {
                return Err(format!("missing argument <{}>", decl.name));
            }
            let items = rest
                .iter()
                .map(|raw| decl.convert(raw))
                .collect::<Result<Vec<_>, _>>()?;
            values.push(Value::Array(items));
            rest = &[];
            continue;
        }
        match rest.split_first() {
            Some((raw, tail)) => {
                values.push(decl.convert(raw)?);
                rest = tail;
            }
            None if decl.required => return Err(format!("missing argument <{}>", decl.name)),
            None => values.push(Value::Null),
        }
    }
    if let Some(extra) = rest.first() {
        return Err(format!("unexpected argument '{extra}'"));
    }
    Ok(values)
}

/// Splits input into words, honouring quotes and backslash escapes.
///
/// Single quotes are literal; inside double quotes and bare words a backslash
/// escapes the next character. Quoted empty strings survive as empty words.
pub fn shell_split(input: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut word = String::new();
    let mut started = false;
    let mut quote = Quote::None;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match (&quote, ch) {
            (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
            (Quote::Single, c) => word.push(c),
            (_, '\\') => {
                if let Some(next) = chars.next() {
                    word.push(next);
                }
                started = true;
            }
            (Quote::Double, c) => word.push(c),
            (Quote::None, '\'') => {
                quote = Quote::Single;
                started = true;
            }
            (Quote::None, '"') => {
                quote = Quote::Double;
                started = true;
            }
            (Quote::None, c) if c.is_whitespace() => {
                if started {
                    words.push(std::mem::take(&mut word));
                    started = false;
                }
            }
            (Quote::None, c) => {
                word.push(c);
                started = true;
            }
        }
    }
    if started {
        words.push(word);
    }
    words
}

// =============================================================================
// Declaration builder
// =============================================================================

/// A command declaration plus its metadata.
pub struct CommandDecl {
    decl: String,
    options: Vec<String>,
    description: Option<String>,
    hidden: bool,
    action: Option<ActionFn>,
}

impl CommandDecl {
    pub fn new(decl: impl Into<String>) -> Self {
        Self {
            decl: decl.into(),
            options: Vec::new(),
            description: None,
            hidden: false,
            action: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares an option, e.g. `-l <lines:integer>`.
    pub fn option(mut self, decl: impl Into<String>) -> Self {
        self.options.push(decl.into());
        self
    }

    /// Hidden commands are left out of help listings.
    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn action<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.action = Some(Arc::new(move |inv| Box::pin(action(inv))));
        self
    }
}

impl From<&str> for CommandDecl {
    fn from(decl: &str) -> Self {
        CommandDecl::new(decl)
    }
}

impl From<String> for CommandDecl {
    fn from(decl: String) -> Self {
        CommandDecl::new(decl)
    }
}

// =============================================================================
// Command
// =============================================================================

/// A registered command.
pub struct Command {
    name: String,
    path: String,
    declaration: String,
    args: Vec<ArgDecl>,
    options: Vec<OptionDecl>,
    description: Option<String>,
    hidden: bool,
    roles: Vec<Role>,
    filters: Vec<Filter>,
    action: Option<ActionFn>,
    parent: Option<Weak<Command>>,
    children: Mutex<Vec<Arc<Command>>>,
    context: ContextId,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slash-separated path from the top-level ancestor, e.g. `config/set`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn declaration(&self) -> &str {
        &self.declaration
    }

    pub fn args(&self) -> &[ArgDecl] {
        &self.args
    }

    pub fn options(&self) -> &[OptionDecl] {
        &self.options
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Roles required to run the command, from the permission table.
    pub fn required_roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn parent(&self) -> Option<Arc<Command>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Command>> {
        self.children.lock().clone()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Command>> {
        self.children.lock().iter().find(|c| c.name == name).cloned()
    }

    /// Whether every filter attached to the command accepts `session`.
    pub fn permits(&self, session: &dyn Session) -> bool {
        self.filters.iter().all(|f| f.test(session))
    }

    /// One-line usage, e.g. `set <key:string> [value:text] (-f [force:boolean])`.
    pub fn usage(&self) -> String {
        let mut usage = self.name.clone();
        for arg in &self.args {
            usage.push(' ');
            usage.push_str(&arg.to_string());
        }
        for option in &self.options {
            usage.push_str(&format!(" ({option})"));
        }
        usage
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("options", &self.options)
            .field("hidden", &self.hidden)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registration & execution
// =============================================================================

impl Context {
    /// Registers a command on this context.
    pub fn command(&self, decl: impl Into<CommandDecl>) -> ContextResult<Arc<Command>> {
        let decl = decl.into();
        let mut tokens = decl.decl.split_whitespace();
        let name_decl = tokens.next().ok_or(ContextError::EmptyCommandName)?;
        let segments: Vec<&str> = name_decl.split('/').filter(|s| !s.is_empty()).collect();
        let (name, prefix) = segments
            .split_last()
            .ok_or(ContextError::EmptyCommandName)?;

        let parent = self.resolve_parent(prefix)?;
        let invalid = |reason| ContextError::InvalidDeclaration {
            decl: decl.decl.clone(),
            reason,
        };
        let args = parse_arg_decls(tokens).map_err(invalid)?;
        let mut options: Vec<OptionDecl> = Vec::with_capacity(decl.options.len());
        for raw in &decl.options {
            let option = OptionDecl::parse(raw).map_err(invalid)?;
            let clash = options
                .iter()
                .any(|o| o.name() == option.name() || (o.short.is_some() && o.short == option.short));
            if clash {
                return Err(invalid(format!("option '{raw}' is declared twice")));
            }
            options.push(option);
        }

        let taken_in_parent = parent.as_ref().is_some_and(|p| p.child(name).is_some());
        let taken_here = self.with_node(|node| node.commands.iter().any(|c| c.name == *name))?;
        if taken_in_parent || taken_here {
            return Err(ContextError::CommandExists {
                name: (*name).to_string(),
            });
        }

        let path = segments.join("/");
        let roles = self.shared.permissions.get(&path).cloned().unwrap_or_default();
        let filters = match roles.is_empty() {
            true => Vec::new(),
            false => vec![Filter::role(roles.iter().copied())],
        };
        let command = Arc::new(Command {
            name: (*name).to_string(),
            path,
            declaration: decl.decl.clone(),
            args,
            options,
            description: decl.description,
            hidden: decl.hidden,
            roles,
            filters,
            action: decl.action,
            parent: parent.as_ref().map(Arc::downgrade),
            children: Mutex::new(Vec::new()),
            context: self.id(),
        });

        self.with_node_mut(|node| node.commands.push(Arc::clone(&command)))?;
        if let Some(parent) = &parent {
            parent.children.lock().push(Arc::clone(&command));
        }
        debug!(command = %command.path, context = %self.id(), "Command registered");
        self.shared
            .notify(names::COMMAND_ADD, Payload::Command(Arc::clone(&command)));

        let shared = Arc::downgrade(&self.shared);
        let registered = Arc::downgrade(&command);
        let owner = self.id();
        self.push_dispose(move || {
            let (Some(shared), Some(command)) = (shared.upgrade(), registered.upgrade()) else {
                return;
            };
            if let Some(node) = shared.tree.lock().nodes.get_mut(&owner) {
                node.commands.retain(|c| !Arc::ptr_eq(c, &command));
            }
            if let Some(parent) = command.parent() {
                parent.children.lock().retain(|c| !Arc::ptr_eq(c, &command));
            }
            debug!(command = %command.path, "Command removed");
            shared.notify(names::COMMAND_REMOVE, Payload::Command(command));
        })?;

        Ok(command)
    }

    fn resolve_parent(&self, prefix: &[&str]) -> ContextResult<Option<Arc<Command>>> {
        let mut current: Option<Arc<Command>> = None;
        for (i, segment) in prefix.iter().enumerate() {
            let next = match &current {
                None => self.find_command(segment),
                Some(parent) => parent.child(segment),
            };
            current = Some(next.ok_or_else(|| ContextError::UnknownParentCommand {
                path: prefix[..=i].join("/"),
            })?);
        }
        Ok(current)
    }

    /// Looks a command up by name across the whole runtime, preferring
    /// top-level commands.
    pub fn find_command(&self, name: &str) -> Option<Arc<Command>> {
        let all = self.root().command_list();
        all.iter()
            .find(|c| c.name == name && c.parent.is_none())
            .or_else(|| all.iter().find(|c| c.name == name))
            .cloned()
    }

    /// Parses `input` and runs the matching command visible to `session`.
    ///
    /// Returns `Ok(None)` when no command matches or the command has no
    /// action; otherwise the action's reply.
    pub async fn execute(&self, session: SessionRef, input: &str) -> ContextResult<Option<String>> {
        let words = shell_split(input);
        let Some((head, mut rest)) = words.split_first() else {
            return Ok(None);
        };

        let visible = self.support_commands(session.as_ref());
        let Some(mut command) = visible
            .iter()
            .find(|c| c.name == *head && c.parent.is_none())
            .or_else(|| visible.iter().find(|c| c.name == *head))
            .cloned()
        else {
            return Ok(None);
        };

        while let Some((word, tail)) = rest.split_first() {
            let child = command
                .child(word)
                .filter(|child| visible.iter().any(|v| Arc::ptr_eq(v, child)));
            match child {
                Some(child) => {
                    command = child;
                    rest = tail;
                }
                None => break,
            }
        }

        if !command.permits(session.as_ref()) {
            return Err(ContextError::PermissionDenied(command.path.clone()));
        }
        let bad_arguments = |reason| ContextError::BadArguments {
            command: command.path.clone(),
            reason,
        };
        let (options, rest) = parse_option_values(&command.options, rest).map_err(bad_arguments)?;
        let args = parse_arg_values(&command.args, &rest).map_err(bad_arguments)?;
        let Some(action) = command.action.clone() else {
            return Ok(None);
        };

        trace!(command = %command.path, ?args, ?options, "Executing command");
        let invocation = Invocation {
            context: self.handle(command.context),
            session,
            command: Arc::clone(&command),
            args,
            options,
        };
        action(invocation)
            .await
            .map_err(|source| ContextError::CommandFailed {
                command: command.path.clone(),
                source,
            })
    }
}
