use triguard::{
    camera::{Camera, CameraSession},
    common::{Config, Paths},
    core::{
        recognizer::crop_face, EnrollmentSettings, EnrollmentState, FaceAnalyzer, SpoofClassifier,
        VerificationSettings, VerificationState,
    },
    fingerprint::{
        spawn_capture, CaptureEvent, CaptureOutcome, CaptureSettings, DescriptorMatcher, FingerprintDevice,
        FingerprintService,
    },
    login::{FaceCheck, FaceFactor, FrameFeed, LoginFlow, LoginOutcome},
    storage::{FileGalleryStore, Gallery, UserStore},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::DynamicImage;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "triguard")]
#[command(about = "Password, face and fingerprint login")]
struct Cli {
    /// Enable development mode (keeps data under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Use system-wide data and config locations
    #[arg(long, global = true)]
    system: bool,

    /// Config file to load instead of the mode default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a user with a password
    AddUser {
        #[arg(short, long)]
        username: String,
        /// Read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Delete a user with their face and fingerprint enrollment
    RemoveUser {
        #[arg(short, long)]
        username: String,
    },
    /// List users and their registration status
    ListUsers,
    /// Enroll a face from the camera
    EnrollFace {
        #[arg(short, long)]
        username: String,
    },
    /// Verify a face against its enrollment
    VerifyFace {
        #[arg(short, long)]
        username: String,
    },
    /// Enroll a fingerprint from the reader
    EnrollFinger {
        #[arg(short, long)]
        username: String,
    },
    /// Verify a fingerprint against its enrollment
    VerifyFinger {
        #[arg(short, long)]
        username: String,
    },
    /// Capture one fingerprint bitmap and print progress events
    CaptureFinger,
    /// Run the full password, face and fingerprint login
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: Option<String>,
    },
}

struct App {
    config: Config,
    paths: Paths,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on mode
    setup_logging(cli.dev);

    let paths = Paths::new(cli.dev, cli.system)?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load_or_default(&config_path)?,
    };
    let paths = paths.with_data_dir(config.storage.data_dir.clone());
    paths.ensure_dirs()?;
    let ctx = App { config, paths };

    match cli.command {
        Commands::AddUser { username, password } => {
            let password = password_or_prompt(password)?;
            let mut flow = open_flow(&ctx)?;
            flow.add_user(&username, &password)?;
            println!("Added user {}", username);
        }
        Commands::RemoveUser { username } => {
            let mut flow = open_flow(&ctx)?;
            if flow.delete_user(&username)? {
                println!("Removed user {}", username);
            } else {
                println!("No such user: {}", username);
            }
        }
        Commands::ListUsers => {
            let flow = open_flow(&ctx)?;
            let names = flow.users().usernames();
            if names.is_empty() {
                println!("No users");
            }
            for name in names {
                let status = flow.status(&name)?;
                println!(
                    "{:<20} face: {:<3} fingerprint: {:<3}{}",
                    name,
                    yes_no(status.face),
                    yes_no(status.fingerprint),
                    if status.is_complete() { "" } else { "  (incomplete)" }
                );
            }
        }
        Commands::EnrollFace { username } => {
            let mut flow = open_flow(&ctx)?;
            let camera = Camera::open(&ctx.config.camera)?;
            let mut feed = CameraFeed::new(camera.start_session()?);
            let analyzer = FaceAnalyzer::from_config(&ctx.config, &ctx.paths)?;
            let liveness = open_liveness(&ctx)?;
            let crop_path = ctx.paths.face_crops_dir().join(format!("{}.png", username.trim()));

            println!("Look at the camera...");
            let state = flow.enroll_face(
                &username,
                EnrollmentSettings::from(&ctx.config.enrollment),
                analyzer,
                liveness,
                &mut feed,
                |frame, face| {
                    crop_face(frame, face).save(&crop_path)?;
                    Ok(())
                },
            )?;

            match state {
                EnrollmentState::Succeeded { identity } => println!("✅ Enrolled face for {}", identity),
                EnrollmentState::Duplicate { identity, similarity } => {
                    println!("❌ Face already enrolled as {} (similarity {:.3})", identity, similarity)
                }
                EnrollmentState::TimedOut => println!("❌ Timed out before enough face samples were captured"),
                other => println!("❌ Enrollment ended: {:?}", other),
            }
        }
        Commands::VerifyFace { username } => {
            let flow = open_flow(&ctx)?;
            let camera = Camera::open(&ctx.config.camera)?;
            let mut check = open_face_check(&ctx, &camera)?;

            println!("Look at the camera...");
            match check.verify(&username, flow.gallery())? {
                VerificationState::Accepted { similarity } => {
                    println!("✅ Face verified (similarity {:.3})", similarity)
                }
                other => println!("❌ Face not verified: {:?}", other),
            }
        }
        Commands::EnrollFinger { username } => {
            let mut flow = open_flow(&ctx)?;
            let mut service = open_fingerprint(&ctx)?;
            println!("Place your finger on the reader...");
            let path = flow.enroll_fingerprint(&username, &mut service, &mut print_events())?;
            println!("✅ Fingerprint saved to {}", path.display());
        }
        Commands::VerifyFinger { username } => {
            let flow = open_flow(&ctx)?;
            let template = flow
                .users()
                .get(&username)
                .and_then(|record| record.fingerprint_path.clone())
                .filter(|path| path.exists())
                .with_context(|| format!("No enrolled fingerprint for {}", username))?;

            let mut service = open_fingerprint(&ctx)?;
            println!("Place your finger on the reader...");
            let verdict = service.verify(&template, &mut print_events())?;
            println!("{} {}", if verdict.ok { "✅" } else { "❌" }, verdict.detail);
        }
        Commands::CaptureFinger => {
            let device = open_fingerprint_device()?;
            let settings = CaptureSettings::from_config(&ctx.config.fingerprint, ctx.paths.capture_dir());
            let (tx, rx) = mpsc::channel::<CaptureEvent>();
            let worker = spawn_capture(device, settings, tx);

            for event in rx {
                print_event(&event);
            }
            let (_device, outcome) = worker
                .join()
                .map_err(|_| anyhow::anyhow!("capture thread panicked"))?;
            match outcome? {
                CaptureOutcome::Saved(image) => println!("✅ Saved {}", image.path.display()),
                CaptureOutcome::Failed { reason, .. } => bail!("capture failed: {}", reason),
            }
        }
        Commands::Login { username, password } => {
            let password = password_or_prompt(password)?;
            let flow = open_flow(&ctx)?;
            let camera = Camera::open(&ctx.config.camera)?;
            let mut face = open_face_check(&ctx, &camera)?;
            let mut fingerprint = open_fingerprint(&ctx)?;

            match flow.login(&username, &password, &mut face, &mut fingerprint)? {
                LoginOutcome::Granted => println!("✅ Login granted for {}", username),
                LoginOutcome::Denied { factor, reason } => {
                    println!("❌ Login denied at {}: {}", factor, reason);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}

/// Camera frames stamped with the time they were pulled.
struct CameraFeed<'a> {
    session: CameraSession<'a>,
}

impl<'a> CameraFeed<'a> {
    fn new(session: CameraSession<'a>) -> Self {
        Self { session }
    }
}

impl FrameFeed for CameraFeed<'_> {
    type Frame = DynamicImage;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn next_frame(&mut self) -> triguard::Result<Option<(DynamicImage, Instant)>> {
        let frame = self.session.capture_frame()?;
        Ok(Some((frame, Instant::now())))
    }
}

fn open_flow(ctx: &App) -> Result<LoginFlow> {
    let users = UserStore::open(ctx.paths.users_file())?;
    let gallery = Gallery::open(Box::new(FileGalleryStore::new(ctx.paths.gallery_file())))?;
    Ok(LoginFlow::new(users, Arc::new(gallery)))
}

fn open_liveness(ctx: &App) -> Result<SpoofClassifier> {
    let path = ctx.paths.model_path(&ctx.config.models.liveness_path);
    Ok(SpoofClassifier::new(&path, ctx.config.models.optimization_level, &ctx.config.liveness)?)
}

fn open_face_check<'a>(
    ctx: &App,
    camera: &'a Camera,
) -> Result<FaceCheck<FaceAnalyzer, SpoofClassifier, CameraFeed<'a>>> {
    Ok(FaceCheck {
        source: FaceAnalyzer::from_config(&ctx.config, &ctx.paths)?,
        liveness: open_liveness(ctx)?,
        feed: CameraFeed::new(camera.start_session()?),
        settings: VerificationSettings::from(&ctx.config.verification),
    })
}

type BoxedDevice = Box<dyn FingerprintDevice + Send>;

#[cfg(feature = "zkfinger")]
fn open_fingerprint_device() -> Result<BoxedDevice> {
    Ok(Box::new(triguard::fingerprint::ZkFingerDevice))
}

#[cfg(not(feature = "zkfinger"))]
fn open_fingerprint_device() -> Result<BoxedDevice> {
    bail!("fingerprint reader support needs the `zkfinger` feature")
}

fn open_fingerprint(ctx: &App) -> Result<FingerprintService<BoxedDevice>> {
    Ok(FingerprintService::new(
        open_fingerprint_device()?,
        &ctx.config.fingerprint,
        ctx.paths.capture_dir(),
        ctx.paths.fingerprint_dir(),
        Box::new(DescriptorMatcher::default()),
    )?)
}

fn print_event(event: &CaptureEvent) {
    match event {
        CaptureEvent::Ready { width, height, .. } => println!("Reader ready ({}x{})", width, height),
        CaptureEvent::Attempt { index, max } => tracing::debug!("Attempt {}/{}", index, max),
        CaptureEvent::Busy { .. } | CaptureEvent::Retry { .. } => {}
        CaptureEvent::Saved { path, tries, .. } => {
            println!("Captured after {} tries: {}", tries, path.display())
        }
        CaptureEvent::Error { message, .. } => println!("Capture error: {}", message),
    }
}

fn print_events() -> triguard::fingerprint::CallbackSink<impl FnMut(&CaptureEvent) -> anyhow::Result<()>> {
    triguard::fingerprint::CallbackSink(|event: &CaptureEvent| {
        print_event(event);
        Ok(())
    })
}

fn password_or_prompt(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    print!("Password: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
