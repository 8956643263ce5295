use anketa_api::{AuthToken, NewUser, Uuid};
use anyhow::Context;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "anketa-ctl", about = "Administration tool for an anketa server")]
struct Opt {
    /// Server to administer, eg. `https://forms.example.org`
    #[structopt(short, long)]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Create a new user account on the server
    CreateUser {
        /// Email the user will log in with
        email: String,

        /// Given name
        name: String,

        /// Family name
        surname: String,

        /// Password for the first login
        initial_password: String,

        /// Grant the new account admin rights
        #[structopt(long)]
        admin: bool,
    },
}

/// The admin token under which all anketa-ctl requests run.
///
/// This is the same ADMIN_TOKEN the server was started with.
fn admin_token() -> anyhow::Result<AuthToken> {
    let token =
        std::env::var("ADMIN_TOKEN").context("recovering the ADMIN_TOKEN environment variable")?;
    let token = Uuid::try_parse(&token).context("parsing ADMIN_TOKEN as an auth token")?;
    Ok(AuthToken(token))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let client = reqwest::Client::new();
    match opt.cmd {
        Command::CreateUser {
            email,
            name,
            surname,
            initial_password,
            admin,
        } => {
            let mut user = NewUser::new(email, name, surname, initial_password);
            user.is_admin = admin;
            client
                .post(format!("{}/api/admin/create-user", opt.host))
                .bearer_auth(admin_token()?.0)
                .json(&user)
                .send()
                .await
                .context("sending the user-creation request")?
                .error_for_status()
                .context("checking the status of the user-creation request")?;
            println!("created user {}", user.id.0);
        }
    }
    Ok(())
}
