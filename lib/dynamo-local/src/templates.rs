//! Template store.
//!
//! Scaffolding files, documentation and canonical API shapes are kept as text templates in a read-only
//! [`TemplateStore`], injected into the builder and the runtime. Templates use `{{ path.to.value }}` placeholders,
//! resolved against any serializable value.

use serde::Serialize;
use serde_json::Value;
use snafu::{OptionExt as _, ResultExt as _, Snafu};

/// Template error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TemplateError {
    /// The template does not exist in the store.
    #[snafu(display("template '{}' not found", path))]
    NotFound {
        /// Template path.
        path: String,
    },

    /// A placeholder was opened but never closed.
    #[snafu(display("unterminated placeholder in template '{}'", path))]
    Unterminated {
        /// Template path.
        path: String,
    },

    /// A placeholder refers to a value absent from the template data.
    #[snafu(display("template '{}' refers to missing value '{}'", path, key))]
    MissingValue {
        /// Template path.
        path: String,

        /// Placeholder key.
        key: String,
    },

    /// The template data could not be converted for rendering.
    #[snafu(display("invalid data for template '{}': {}", path, source))]
    InvalidData {
        /// Template path.
        path: String,

        /// Error source.
        source: serde_json::Error,
    },
}

/// A read-only collection of templates, addressed by slash-separated paths.
pub trait TemplateStore: Send + Sync {
    /// Gets the raw contents of the template at `path`.
    fn get(&self, path: &str) -> Option<&str>;

    /// Lists the paths of all templates under `prefix`, in a stable order.
    fn list(&self, prefix: &str) -> Vec<&str>;
}

/// Renders the template at `path` from `store` with `data`.
///
/// # Errors
///
/// If the template does not exist, is malformed, or refers to values missing from `data`, an error is returned.
pub fn render<T>(store: &dyn TemplateStore, path: &str, data: &T) -> Result<String, TemplateError>
where
    T: Serialize + ?Sized,
{
    let template = store.get(path).context(NotFound { path })?;
    let data = serde_json::to_value(data).context(InvalidData { path })?;
    render_str(path, template, &data)
}

/// Templates compiled into the binary.
pub struct EmbeddedTemplates {
    entries: &'static [(&'static str, &'static str)],
}

impl EmbeddedTemplates {
    /// Returns the templates shipped with this crate.
    pub fn bundled() -> Self {
        Self { entries: BUNDLED }
    }

    /// Creates a store over the given `(path, contents)` entries.
    pub fn from_entries(entries: &'static [(&'static str, &'static str)]) -> Self {
        Self { entries }
    }
}

impl TemplateStore for EmbeddedTemplates {
    fn get(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry_path, _)| *entry_path == path)
            .map(|(_, contents)| *contents)
    }

    fn list(&self, prefix: &str) -> Vec<&str> {
        let mut paths = self
            .entries
            .iter()
            .map(|(path, _)| *path)
            .filter(|path| path.starts_with(prefix))
            .collect::<Vec<_>>();
        paths.sort_unstable();
        paths
    }
}

static BUNDLED: &[(&str, &str)] = &[
    ("agent/README.md", include_str!("../templates/agent/README.md")),
    ("api/tcp.yaml", include_str!("../templates/api/tcp.yaml")),
    (
        "factory/GETTING_STARTED.md",
        include_str!("../templates/factory/GETTING_STARTED.md"),
    ),
    ("factory/README.md", include_str!("../templates/factory/README.md")),
    (
        "factory/tables/README.md",
        include_str!("../templates/factory/tables/README.md"),
    ),
];

fn render_str(path: &str, template: &str, data: &Value) -> Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").context(Unterminated { path })?;

        let key = after_open[..end].trim();
        let value = lookup(data, key).context(MissingValue { path, key })?;
        match value {
            Value::String(s) => rendered.push_str(s),
            Value::Null => {}
            other => rendered.push_str(&other.to_string()),
        }

        rest = &after_open[end + 2..];
    }

    rendered.push_str(rest);
    Ok(rendered)
}

fn lookup<'a>(data: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .try_fold(data, |current, segment| current.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    static ENTRIES: &[(&str, &str)] = &[
        ("greeting.txt", "Hello, {{ person.name }}! You are {{person.age}}."),
        ("broken.txt", "Hello, {{ person.name"),
        ("nested/b.txt", "b"),
        ("nested/a.txt", "a"),
    ];

    #[test]
    fn render_resolves_nested_keys() {
        let store = EmbeddedTemplates::from_entries(ENTRIES);
        let rendered = render(
            &store,
            "greeting.txt",
            &json!({ "person": { "name": "Ada", "age": 36 } }),
        )
        .unwrap();

        assert_eq!(rendered, "Hello, Ada! You are 36.");
    }

    #[test]
    fn render_errors() {
        let store = EmbeddedTemplates::from_entries(ENTRIES);
        let data = json!({ "person": { "name": "Ada" } });

        assert!(matches!(
            render(&store, "missing.txt", &data),
            Err(TemplateError::NotFound { .. })
        ));
        assert!(matches!(
            render(&store, "broken.txt", &data),
            Err(TemplateError::Unterminated { .. })
        ));

        let err = render(&store, "greeting.txt", &data).unwrap_err();
        assert_eq!(
            err.to_string(),
            "template 'greeting.txt' refers to missing value 'person.age'"
        );
    }

    #[test]
    fn list_is_sorted_and_filtered() {
        let store = EmbeddedTemplates::from_entries(ENTRIES);
        assert_eq!(store.list("nested/"), vec!["nested/a.txt", "nested/b.txt"]);
    }

    #[test]
    fn bundled_templates_are_present() {
        let store = EmbeddedTemplates::bundled();
        assert!(store.get("api/tcp.yaml").is_some());
        assert!(store.get("agent/README.md").is_some());
        assert!(!store.list("factory/").is_empty());
    }
}
