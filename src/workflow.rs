//! Interactive menu loop sequencing registration, authorization and
//! sign-out.
//!
//! One operator command is processed per iteration; every failure is
//! reported and returns control to the menu. Input validation runs before
//! any browser or store contact, so a mismatched secret or an empty
//! account list never costs a network round-trip.

use anyhow::Result;
use console::style;
use dialoguer::{Input, Password, Select};
use thiserror::Error;

use crate::browser::{DriverError, SignupForm, SiteDriver};
use crate::notifier::{Event, NotifierHandle};
use crate::store::{hash_secret, Account, AccountStore};

/// Controller state: at most one account is signed in at a time.
enum OperatorState {
    Unauthenticated,
    Authenticated { username: String },
}

/// What the operator typed into the registration prompts.
#[derive(Debug, Clone)]
pub struct RegistrationInput {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub secret: String,
    pub secret_repeat: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("all fields must be filled in")]
    EmptyField,
    #[error("the secrets do not match")]
    SecretMismatch,
}

impl RegistrationInput {
    /// Reject incomplete or inconsistent input before anything external
    /// is contacted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fields = [
            &self.username,
            &self.email,
            &self.first_name,
            &self.last_name,
            &self.secret,
            &self.secret_repeat,
        ];
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err(ValidationError::EmptyField);
        }
        if self.secret != self.secret_repeat {
            return Err(ValidationError::SecretMismatch);
        }
        Ok(())
    }

    fn into_form(self) -> SignupForm {
        SignupForm {
            username: self.username,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            secret: self.secret,
            secret_repeat: self.secret_repeat,
        }
    }
}

/// Parse a 1-based menu number typed by the operator.
pub fn parse_choice(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|n| *n >= 1)
}

/// Resolve a 1-based choice against the account list.
pub fn select_account(accounts: &[Account], one_based: usize) -> Option<&Account> {
    one_based.checked_sub(1).and_then(|i| accounts.get(i))
}

/// The interactive controller. Owns the three services and the state.
pub struct Workflow {
    store: AccountStore,
    driver: SiteDriver,
    notifier: NotifierHandle,
    state: OperatorState,
}

impl Workflow {
    pub fn new(store: AccountStore, driver: SiteDriver, notifier: NotifierHandle) -> Self {
        Self {
            store,
            driver,
            notifier,
            state: OperatorState::Unauthenticated,
        }
    }

    /// Run the menu loop until the operator quits. Blocks on console input
    /// between iterations.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match &self.state {
                OperatorState::Unauthenticated => {
                    let items = ["Register", "Sign in", "Status", "Quit"];
                    let choice = Select::new()
                        .with_prompt("Choose an action")
                        .items(&items)
                        .default(0)
                        .interact()?;
                    match choice {
                        0 => {
                            if let Err(e) = self.register().await {
                                self.print_failure("Registration failed", &e);
                            }
                        }
                        1 => {
                            if let Err(e) = self.authorize().await {
                                self.print_failure("Sign-in failed", &e);
                            }
                        }
                        2 => {
                            if let Err(e) = self.status() {
                                self.print_failure("Status unavailable", &e);
                            }
                        }
                        _ => {
                            self.quit().await;
                            return Ok(());
                        }
                    }
                }
                OperatorState::Authenticated { username } => {
                    let username = username.clone();
                    println!("{}", style(format!("Signed in as {username}")).green());
                    let items = ["Session history", "Sign out", "Quit"];
                    let choice = Select::new()
                        .with_prompt("Choose an action")
                        .items(&items)
                        .default(0)
                        .interact()?;
                    match choice {
                        0 => {
                            if let Err(e) = self.history(&username) {
                                self.print_failure("History unavailable", &e);
                            }
                        }
                        1 => self.sign_out().await,
                        _ => {
                            self.quit().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    // ── Flows ───────────────────────────────────────────────────────

    async fn register(&mut self) -> Result<()> {
        let input = prompt_registration()?;
        if let Err(e) = input.validate() {
            println!("{}", style(format!("Error: {e}.")).red());
            return Ok(());
        }

        let username = input.username.clone();
        let secret_hash = hash_secret(&input.secret);

        self.driver.sign_up(&input.into_form()).await?;

        let account_id = self.store.insert_account(&username, &secret_hash)?;
        tracing::info!(username = %username, account_id, "Account registered");
        self.notifier.notify(Event::Registered {
            username: username.clone(),
            account_id,
        });

        println!("{}", style(format!("Registration successful for {username}!")).green());
        self.state = OperatorState::Authenticated { username };
        Ok(())
    }

    async fn authorize(&mut self) -> Result<()> {
        // List before any browser contact; an empty store means there is
        // nothing to sign in as.
        let accounts = self.store.list_accounts()?;
        if accounts.is_empty() {
            println!("{}", style("Error: no registered users.").red());
            return Ok(());
        }

        println!("Registered accounts:");
        for (i, account) in accounts.iter().enumerate() {
            println!(
                "{}. {} (registered {})",
                i + 1,
                account.username,
                format_epoch(account.registration_time)
            );
        }

        let raw: String = Input::new()
            .with_prompt("Select an account (number)")
            .allow_empty(true)
            .interact_text()?;
        let Some(account) = parse_choice(&raw).and_then(|n| select_account(&accounts, n)) else {
            println!("{}", style("Error: invalid account selection.").red());
            return Ok(());
        };
        let username = account.username.clone();
        let account_id = account.id;

        let secret: String = Password::new()
            .with_prompt(format!("Secret for {username}"))
            .allow_empty_password(true)
            .interact()?;

        self.driver.sign_in(&username, &secret).await?;

        self.store.record_session(account_id)?;
        tracing::info!(username = %username, account_id, "Account signed in");
        self.notifier.notify(Event::SignedIn {
            username: username.clone(),
        });

        println!("{}", style(format!("Sign-in successful for {username}!")).green());
        self.state = OperatorState::Authenticated { username };
        Ok(())
    }

    async fn sign_out(&mut self) {
        let username = match &self.state {
            OperatorState::Authenticated { username } => username.clone(),
            OperatorState::Unauthenticated => return,
        };

        // Teardown is attempted inside sign_out even when the confirmation
        // wait times out; the session is gone either way.
        match self.driver.sign_out().await {
            Ok(()) => {
                tracing::info!(username = %username, "Account signed out");
                self.notifier.notify(Event::SignedOut {
                    username: username.clone(),
                });
                println!("{}", style(format!("{username} signed out.")).green());
            }
            Err(e) => self.print_failure("Sign-out incomplete", &e.into()),
        }
        self.state = OperatorState::Unauthenticated;
    }

    /// Store totals, shown without touching the browser.
    fn status(&self) -> Result<()> {
        println!(
            "{} registered account(s), {} recorded session(s).",
            self.store.account_count()?,
            self.store.session_count()?
        );
        Ok(())
    }

    /// Recorded authorization events for the signed-in account.
    fn history(&self, username: &str) -> Result<()> {
        let Some(account) = self.store.find_account(username)? else {
            // Possible when the account was registered on the site but the
            // local insert failed; nothing to show.
            println!("No local record for {username}.");
            return Ok(());
        };
        let records = self.store.sessions_for(account.id)?;
        if records.is_empty() {
            println!("No recorded sessions for {username}.");
            return Ok(());
        }
        println!("Sessions for {username}:");
        for record in records {
            debug_assert_eq!(record.account_id, account.id);
            println!("  #{}: {}", record.id, format_epoch(record.authorization_time));
        }
        Ok(())
    }

    /// Quit cleanup: sign out if a session is active, then make sure no
    /// browser is left behind.
    async fn quit(&mut self) {
        if matches!(self.state, OperatorState::Authenticated { .. }) {
            self.sign_out().await;
        }
        self.driver.dispose().await;
        println!("Exiting.");
    }

    fn print_failure(&self, what: &str, error: &anyhow::Error) {
        // Element-not-found and timeout failures keep the browser open so
        // the operator can simply pick the action again.
        tracing::error!("{what}: {error}");
        match error.downcast_ref::<DriverError>() {
            Some(DriverError::FormRejected(errors)) => {
                println!("{}", style(format!("{what}: {}", errors.join("; "))).red());
            }
            Some(e) => println!("{}", style(format!("{what}: {e}")).red()),
            None => println!("{}", style(format!("{what}: {error}")).red()),
        }
    }
}

/// Collect the registration fields from the console. Secrets are read
/// without echo.
fn prompt_registration() -> Result<RegistrationInput> {
    let username: String = Input::new()
        .with_prompt("Username")
        .allow_empty(true)
        .interact_text()?;
    let email: String = Input::new()
        .with_prompt("Email")
        .allow_empty(true)
        .interact_text()?;
    let first_name: String = Input::new()
        .with_prompt("First name")
        .allow_empty(true)
        .interact_text()?;
    let last_name: String = Input::new()
        .with_prompt("Last name")
        .allow_empty(true)
        .interact_text()?;
    let secret: String = Password::new()
        .with_prompt("Secret")
        .allow_empty_password(true)
        .interact()?;
    let secret_repeat: String = Password::new()
        .with_prompt("Repeat secret")
        .allow_empty_password(true)
        .interact()?;

    Ok(RegistrationInput {
        username,
        email,
        first_name,
        last_name,
        secret,
        secret_repeat,
    })
}

/// Render an epoch-seconds timestamp for the account list.
fn format_epoch(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

// ── Tests ───────────────────────────────────────────────────────────
