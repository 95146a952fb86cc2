use std::process::exit;

pub struct Options {
    pub server: String,
    pub mountpoint: String,
    pub username: String,
    pub password: String,
    pub location: String,
    pub fork: bool,
    pub debug: bool,
    pub debug_fuse: bool
}

#[derive(Default)]
struct MountOpts {
    user: Option<String>,
    pass: Option<String>,
    loc: Option<String>,
    fork: bool
}

fn parse_mount_opts(opts: &str) -> MountOpts {
    let mut parsed = MountOpts::default();
    for opt in opts.split(',') {
        if opt == "fork" {
            parsed.fork = true;
            continue
        }
        let mut parts = opt.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some("user"), Some(value)) => parsed.user = Some(value.to_string()),
            (Some("pass"), Some(value)) => parsed.pass = Some(value.to_string()),
            (Some("loc"), Some(value)) => parsed.loc = Some(value.to_string()),
            _ => println!("Skipping unknown option '{}'", opt)
        }
    }
    parsed
}

pub fn parse() -> Options {
    let args = clap_app!(eclipfs =>
        (version: env!("CARGO_PKG_VERSION"))
        (about: "Mounts an eclipfs filesystem")
        (@arg SERVER: +required "metaserver URL")
        (@arg MOUNTPOINT: +required "where to mount the file system")
        (@arg options: -o +required +takes_value "mount options: user=USER,pass=PASS,loc=LOCATION[,fork]")
        (@arg debug: --debug "enable debug logging")
        (@arg debug_fuse: --("debug-fuse") "enable FUSE debug output")
    ).get_matches();

    let opts = parse_mount_opts(args.value_of("options").unwrap());
    let (username, password, location) = match (opts.user, opts.pass, opts.loc) {
        (Some(user), Some(pass), Some(loc)) => (user, pass, loc),
        _ => {
            println!("Missing required option");
            println!("Must specify: user, pass, loc");
            exit(1);
        }
    };

    Options {
        server: args.value_of("SERVER").unwrap().to_string(),
        mountpoint: args.value_of("MOUNTPOINT").unwrap().to_string(),
        username: username,
        password: password,
        location: location,
        fork: opts.fork,
        debug: args.is_present("debug"),
        debug_fuse: args.is_present("debug_fuse")
    }
}
