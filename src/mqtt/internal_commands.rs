
use log::{error, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};
use crate::mqtt::{SubscribeData, Transmission};

#[derive(Debug, PartialEq)]
pub enum Command {
    /// Start a readout outside of the schedule
    Readout,
    Restart,
}

impl Command {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload.trim() {
            "readout" => Some(Command::Readout),
            "restart" => Some(Command::Restart),
            _ => None,
        }
    }
}

pub struct CommandHandler {
   sender: Sender<Transmission>,
   meter_name: String,
   trigger: Sender<()>,
}

impl CommandHandler {

  pub fn new(sender: Sender<Transmission>, meter_name: &str, trigger: Sender<()>) -> Self {
    return CommandHandler {
      sender,
      meter_name: meter_name.to_string(),
      trigger,
    }
  }

  pub async fn start_thread(&self) {
        info!("Starting CommandHandler thread");
        let (sender, receiver) = tokio::sync::mpsc::channel(10);

        let register = Transmission::Subscribe(SubscribeData{
            topic: format!("{}/command", self.meter_name),
            sender
        });

        if let Err(e) = self.sender.send(register).await {
            error!("Unable to subscribe to commands: {e}");
            return;
        }

        info!("Start waiting for command messages");
        self.handle_commands(receiver).await;
  }

  /// Runs until a restart is requested or the subscription is gone.
  pub async fn handle_commands(&self, mut receiver: Receiver<String>) {
        while let Some(c) = receiver.recv().await {
            info!("Received command {c}");

            match Command::parse(&c) {
                Some(Command::Readout) => {
                    // a full channel means a trigger is already pending
                    if self.trigger.try_send(()).is_err() {
                        warn!("Readout trigger already pending");
                    }
                }
                Some(Command::Restart) => {
                    /* if we exit that thread the rest will exit, too */
                    info!("Request to shutdown received");
                    return;
                }
                None => warn!("Unknown command '{c}'"),
            }
        }
  }
}
