use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use comaster::config::parse_number;
use comaster::frame::DataType;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_NODE_NAME: &str = "master";
const DATA_TYPES: &[&str] = &["bool", "i8", "i16", "i32", "u8", "u16", "u32"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let object_args = [
        Arg::with_name("nodeid").help("Node id (1-127)").required(true),
        Arg::with_name("index").help("Object index, e.g. 0x2000").required(true),
        Arg::with_name("subindex").help("Object sub-index").required(true),
        Arg::with_name("type")
            .short("t")
            .long("type")
            .value_name("TYPE")
            .help("Object data type")
            .takes_value(true)
            .possible_values(DATA_TYPES)
            .default_value("u32"),
    ];

    let matches = App::new("coctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Command line client for the CANopen master service")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Master host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Master service port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("node-name")
                .short("n")
                .long("node-name")
                .value_name("NAME")
                .help("Name of the master node (service prefix)")
                .takes_value(true)
                .default_value(DEFAULT_NODE_NAME)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Check that the master service is responsive"))
        .subcommand(
            SubCommand::with_name("read")
                .about("Read an object from a node's object dictionary")
                .args(&object_args),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write an object of a node's object dictionary")
                .args(&object_args)
                .arg(Arg::with_name("value").help("Value to write").required(true)),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let node_name = matches.value_of("node-name").unwrap_or(DEFAULT_NODE_NAME);
    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("ping", _) => handle_ping(host, port, format).await?,
        ("read", Some(sub_matches)) => handle_read(sub_matches, host, port, node_name, format).await?,
        ("write", Some(sub_matches)) => handle_write(sub_matches, host, port, node_name, format).await?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }

    Ok(())
}

async fn handle_ping(host: &str, port: u16, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let response = send_request(host, port, json!({ "id": 1, "service": "ping" })).await?;

    if format == "json" {
        println!("{}", response);
    } else if response["status"] == "Success" {
        let name = response["response"]["node_name"].as_str().unwrap_or("?");
        println!("{} master {} is responsive", "✅".green(), name.bright_cyan());
    } else {
        println!("{} {}", "❌".red(), "Ping failed".bright_red());
    }
    Ok(())
}

async fn handle_read(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    node_name: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (nodeid, index, subindex, data_type) = object_address(matches)?;
    let request = json!({
        "id": 2,
        "service": format!("{}/sdo_read", node_name),
        "request": { "nodeid": nodeid, "index": index, "subindex": subindex, "type": data_type.tag() },
    });
    let response = send_request(host, port, request).await?;

    if format == "json" {
        println!("{}", response);
        return Ok(());
    }
    let address = format!("{}:{:04X}:{:02X}", nodeid, index, subindex);
    match outcome(&response) {
        Ok(body) => {
            let data = body["data"].as_u64().unwrap_or_default();
            println!(
                "{} {} = {} ({:#x}) {}",
                "✅".green(),
                address.bright_white(),
                data.to_string().bright_cyan(),
                data,
                data_type.name().dimmed()
            );
        }
        Err(message) => println!("{} read {} failed: {}", "❌".red(), address.bright_white(), message.bright_red()),
    }
    Ok(())
}

async fn handle_write(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    node_name: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (nodeid, index, subindex, data_type) = object_address(matches)?;
    let value = parse_number(matches.value_of("value").unwrap_or_default())
        .ok_or("value must be a decimal or 0x-prefixed hex number")?;
    let request = json!({
        "id": 3,
        "service": format!("{}/sdo_write", node_name),
        "request": { "nodeid": nodeid, "index": index, "subindex": subindex, "type": data_type.tag(), "data": value },
    });
    let response = send_request(host, port, request).await?;

    if format == "json" {
        println!("{}", response);
        return Ok(());
    }
    let address = format!("{}:{:04X}:{:02X}", nodeid, index, subindex);
    match outcome(&response) {
        Ok(_) => println!("{} {} set to {}", "✅".green(), address.bright_white(), value.to_string().bright_cyan()),
        Err(message) => println!("{} write {} failed: {}", "❌".red(), address.bright_white(), message.bright_red()),
    }
    Ok(())
}

/// Handler body on success, otherwise a message explaining the failure.
fn outcome(response: &Value) -> Result<&Value, String> {
    match response["status"].as_str().unwrap_or("Unknown") {
        "Success" if response["response"]["success"] == true => Ok(&response["response"]),
        "Success" => Err("rejected by the master (see its log for the cause)".to_string()),
        status => Err(format!(
            "{}: {}",
            status,
            response["message"].as_str().unwrap_or("no details")
        )),
    }
}

fn object_address(matches: &ArgMatches<'_>) -> Result<(u8, u16, u8, DataType), Box<dyn std::error::Error>> {
    let number = |name: &str| {
        matches
            .value_of(name)
            .and_then(parse_number)
            .ok_or_else(|| format!("{} must be a decimal or 0x-prefixed hex number", name))
    };
    let nodeid = u8::try_from(number("nodeid")?)?;
    let index = u16::try_from(number("index")?)?;
    let subindex = u8::try_from(number("subindex")?)?;
    let data_type = data_type(matches.value_of("type").unwrap_or("u32")).ok_or("unknown data type")?;
    Ok((nodeid, index, subindex, data_type))
}

fn data_type(name: &str) -> Option<DataType> {
    match name {
        "bool" => Some(DataType::Boolean),
        "i8" => Some(DataType::Integer8),
        "i16" => Some(DataType::Integer16),
        "i32" => Some(DataType::Integer32),
        "u8" => Some(DataType::Unsigned8),
        "u16" => Some(DataType::Unsigned16),
        "u32" => Some(DataType::Unsigned32),
        _ => None,
    }
}

async fn send_request(host: &str, port: u16, request: Value) -> Result<Value, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to master at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Start it with: {}", "💡".yellow(), "comaster --simulate".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let exchange = async {
        let (reader, mut writer) = stream.into_split();
        let mut line = request.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;

        let mut response = String::new();
        if BufReader::new(reader).read_line(&mut response).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Server closed connection",
            ));
        }
        Ok::<String, std::io::Error>(response)
    };

    match tokio::time::timeout(std::time::Duration::from_secs(5), exchange).await {
        Ok(response) => Ok(serde_json::from_str(&response?)?),
        Err(_) => {
            eprintln!("{} Request timed out after 5 seconds", "⏰".yellow());
            Err("request timeout".into())
        }
    }
}
