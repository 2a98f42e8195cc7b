use std::fmt::Display;
use std::io::IsTerminal;

use clap::ValueEnum;
use nu_ansi_term::{Color, Style};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Theme {
    Auto,
    Light,
    Dark,
    Plain,
}

/// Text renderer for check reports. Reports and corruption go to stdout,
/// concern overflow warnings to stderr.
pub struct Ui {
    palette: Palette,
    paint: bool,
}

impl Ui {
    pub fn new(theme: Theme) -> Self {
        let paint = theme != Theme::Plain && std::io::stdout().is_terminal();

        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        let palette = match theme {
            Theme::Light => Palette::light(),
            Theme::Dark | Theme::Auto | Theme::Plain => Palette::dark(),
        };
        Self { palette, paint }
    }

    /// Prints `title` followed by right-aligned `key: value` rows.
    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(&str, String)> = rows
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();
        if rows.is_empty() {
            return;
        }
        self.heading(title);
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            println!(
                "  {} {}",
                self.styled(self.palette.key, format!("{key:>width$}:")),
                self.styled(self.palette.value, value)
            );
        }
    }

    pub fn list<I>(&self, title: &str, entries: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries = entries.into_iter().peekable();
        if entries.peek().is_none() {
            return;
        }
        self.heading(title);
        let bullet = if self.paint { "•" } else { "-" };
        for entry in entries {
            println!("  {} {entry}", self.styled(self.palette.concern, bullet));
        }
    }

    pub fn success(&self, message: &str) {
        println!("{} {message}", self.styled(self.palette.passed, "✔"));
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {message}", self.styled(self.palette.concern, "⚠"));
    }

    pub fn failure(&self, message: &str) {
        println!("{} {message}", self.styled(self.palette.corrupt, "✘"));
    }

    fn heading(&self, title: &str) {
        println!("{}", self.styled(self.palette.heading, format!("▸ {title}")));
    }

    fn styled(&self, style: Style, text: impl Into<String>) -> String {
        let text = text.into();
        if self.paint {
            style.paint(text).to_string()
        } else {
            text
        }
    }
}

#[derive(Clone, Copy)]
struct Palette {
    heading: Style,
    key: Style,
    value: Style,
    passed: Style,
    concern: Style,
    corrupt: Style,
}

impl Palette {
    fn dark() -> Self {
        Self {
            heading: Style::new().fg(Color::Purple).bold(),
            key: Style::new().fg(Color::LightBlue).bold(),
            value: Style::new().fg(Color::White),
            passed: Style::new().fg(Color::LightGreen).bold(),
            concern: Style::new().fg(Color::Yellow).bold(),
            corrupt: Style::new().fg(Color::LightRed).bold(),
        }
    }

    fn light() -> Self {
        Self {
            heading: Style::new().fg(Color::Blue).bold(),
            key: Style::new().fg(Color::Black).bold(),
            value: Style::new().fg(Color::Black),
            passed: Style::new().fg(Color::Green).bold(),
            concern: Style::new().fg(Color::Purple).bold(),
            corrupt: Style::new().fg(Color::Red).bold(),
        }
    }
}
