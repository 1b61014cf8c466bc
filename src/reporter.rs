/// Progress notifications about a running invocation.
///
/// Fire-and-forget: the engine never looks at what a reporter does with them.
pub trait Reporter: Send + Sync {
    fn start(&self, text: &str);
    fn succeed(&self, text: &str);
    fn fail(&self, text: &str);
}

/// Prints progress lines to the terminal and mirrors them into the log.
#[derive(Debug, Default, Clone)]
pub struct ConsoleReporter {
    quiet: bool,
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Reporter for ConsoleReporter {
    fn start(&self, text: &str) {
        tracing::info!("{}", text);
        if !self.quiet {
            eprintln!("… {}", text);
        }
    }

    fn succeed(&self, text: &str) {
        tracing::info!("{}", text);
        if !self.quiet {
            eprintln!("✓ {}", text);
        }
    }

    fn fail(&self, text: &str) {
        tracing::error!("{}", text);
        if !self.quiet {
            eprintln!("✗ {}", text);
        }
    }
}
