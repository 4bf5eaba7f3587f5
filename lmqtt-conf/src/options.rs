use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "lmqttd", about = "MQTT v3.1/v3.1.1 broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Listener bind ip, overrides `listener.ip`
    #[structopt(name = "ip", long)]
    pub ip: Option<String>,

    /// Listener port, overrides `listener.port`
    #[structopt(name = "port", short = "p", long)]
    pub port: Option<u16>,

    /// Log every packet in and out
    #[structopt(name = "debug", long)]
    pub debug: bool,
}
