// Copyright 2022 The EvHttpd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::load_yaml;
use clap::App;
use clap::ArgMatches;
use evhttpd_evh::{Server, ServerConfig};
use evhttpd_log::{log_error, Level, Log};
use evhttpd_pool::{SqlPool, SqlPoolConfig};
use evhttpd_util::{Error, ErrorKind};
use std::str::FromStr;
use std::sync::Arc;

fn main() {
	match real_main() {
		Ok(_) => {}
		Err(e) => {
			println!("evhttpd failed: {}", e.to_string());
			std::process::exit(1);
		}
	}
}

fn arg_or<T: FromStr>(args: &ArgMatches, name: &str, default: T) -> Result<T, Error> {
	match args.value_of(name) {
		Some(value) => value.parse().map_err(|_| {
			let error: Error =
				ErrorKind::SetupError(format!("invalid value for --{}: {}", name, value)).into();
			error
		}),
		None => Ok(default),
	}
}

fn string_arg(args: &ArgMatches, name: &str, default: &str) -> String {
	match args.value_of(name) {
		Some(value) => value.to_string(),
		None => default.to_string(),
	}
}

fn real_main() -> Result<(), Error> {
	let yml = load_yaml!("evh.yml");
	let args = App::from_yaml(yml)
		.version(env!("CARGO_PKG_VERSION"))
		.get_matches();

	let log = if args.is_present("nolog") {
		Log::disabled()
	} else {
		let level = Level::from_usize(arg_or(&args, "loglevel", 1usize)?);
		let queue_size: usize = arg_or(&args, "logqueue", 1024)?;
		Log::init(level, "./log", ".log", queue_size)?
	};

	let sql_pool_size: usize = arg_or(&args, "sqlpool", 12)?;
	let db = if sql_pool_size > 0 {
		let sql_config = SqlPoolConfig {
			host: string_arg(&args, "sqlhost", "localhost"),
			port: arg_or(&args, "sqlport", 3306)?,
			user: string_arg(&args, "sqluser", "root"),
			password: string_arg(&args, "sqlpwd", "root"),
			db_name: string_arg(&args, "dbname", "webserver"),
			pool_size: sql_pool_size,
		};
		match SqlPool::init(&sql_config) {
			Ok(pool) => Some(Arc::new(pool)),
			Err(e) => {
				log_error!(log, "sql pool init error: {}", e);
				return Err(e);
			}
		}
	} else {
		// run without a database; form auth always answers 403
		None
	};

	let src_dir = match args.value_of("root") {
		Some(value) => value.to_string(),
		None => {
			let mut dir = std::env::current_dir()?;
			dir.push("resources");
			dir.to_string_lossy().into_owned()
		}
	};

	let config = ServerConfig {
		host: string_arg(&args, "host", "0.0.0.0"),
		port: arg_or(&args, "port", 1316)?,
		trig_mode: arg_or(&args, "trigmode", 3)?,
		timeout_ms: arg_or(&args, "timeout", 60_000)?,
		open_linger: args.is_present("linger"),
		src_dir,
		threads: arg_or(&args, "threads", 8)?,
	};

	let mut server = Server::new(config, db, log)?;
	server.start()
}
