use std::fmt::Display;

use console::style;
use tabled::Tabled;
use tabled::builder::Builder;
use tabled::settings::Style;

/// Writes command output to stdout, staying silent under `--quiet`.
#[derive(Debug, Clone, Default)]
pub struct Printer {
    quiet: bool,
    #[cfg(test)]
    captured: Option<std::sync::Arc<std::sync::Mutex<String>>>,
}

impl Printer {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            ..Self::default()
        }
    }

    /// A printer that records plain-text output instead of writing it.
    #[cfg(test)]
    pub fn capturing() -> Self {
        Self {
            captured: Some(Default::default()),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn output(&self) -> String {
        self.captured
            .as_ref()
            .map(|buf| buf.lock().unwrap().clone())
            .unwrap_or_default()
    }

    fn emit(&self, text: impl Display) {
        let text = text.to_string();
        if !self.capture(&text) {
            println!("{}", text);
        }
    }

    #[cfg(test)]
    fn capture(&self, text: &str) -> bool {
        let Some(buf) = &self.captured else {
            return false;
        };
        let mut buf = buf.lock().unwrap();
        buf.push_str(&console::strip_ansi_codes(text));
        buf.push('\n');
        true
    }

    #[cfg(not(test))]
    fn capture(&self, _text: &str) -> bool {
        false
    }

    pub fn line(&self, message: impl Display) {
        if !self.quiet {
            self.emit(message);
        }
    }

    pub fn success(&self, message: impl Display) {
        if !self.quiet {
            self.emit(format!("{} {}", style("✓").green().bold(), message));
        }
    }

    pub fn note(&self, message: impl Display) {
        if !self.quiet {
            self.emit(format!("{} {}", style("Note:").yellow().bold(), message));
        }
    }

    pub fn table<T: Tabled>(&self, title: &str, rows: impl IntoIterator<Item = T>) {
        if self.quiet {
            return;
        }
        let mut table = tabled::Table::new(rows);
        table.with(Style::rounded());
        self.emit(style(title).bold());
        self.emit(table);
    }

    /// A table built from raw rows. Only a given `header` is set off by a rule.
    pub fn grid(&self, title: &str, header: Option<&[&str]>, rows: Vec<Vec<String>>) {
        if self.quiet {
            return;
        }
        let mut builder = Builder::default();
        if let Some(header) = header {
            builder.push_record(header.iter().copied());
        }
        for row in rows {
            builder.push_record(row);
        }
        let mut table = builder.build();
        match header {
            Some(_) => table.with(Style::rounded()),
            None => table.with(Style::rounded().remove_horizontals()),
        };
        self.emit(style(title).bold());
        self.emit(table);
    }

    /// Machine-readable output, printed even under `--quiet`.
    pub fn data(&self, value: impl Display) {
        self.emit(value);
    }
}

/// Wrap a URL so terminals render it as a link.
pub fn link(url: &str) -> String {
    style(url).cyan().underlined().to_string()
}
