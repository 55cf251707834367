use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

/// Preferencias persistidas de un servidor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSettings {
    pub guild_id: u64,
    pub volume_pct: u8,
    pub updated_at: DateTime<Utc>,
}

/// Almacenamiento de preferencias por guild en archivos JSON.
///
/// Un archivo `guilds/guild_{id}.json` por servidor, cargados en memoria al
/// arrancar. Solo se escribe cuando algo cambia.
pub struct GuildSettingsStore {
    data_dir: PathBuf,
    guilds: HashMap<u64, GuildSettings>,
}

impl GuildSettingsStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let guilds_dir = data_dir.join("guilds");
        fs::create_dir_all(&guilds_dir)
            .await
            .with_context(|| format!("No se pudo crear {}", guilds_dir.display()))?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let mut store = Self {
            data_dir,
            guilds: HashMap::new(),
        };
        store.load_all().await?;
        Ok(store)
    }

    /// Volumen guardado para el guild, si alguien lo cambió alguna vez
    pub fn volume(&self, guild_id: u64) -> Option<u8> {
        self.guilds.get(&guild_id).map(|settings| settings.volume_pct)
    }

    pub async fn set_volume(&mut self, guild_id: u64, volume_pct: u8) -> Result<()> {
        let volume_pct = volume_pct.min(100);
        if self.volume(guild_id) == Some(volume_pct) {
            return Ok(());
        }

        let settings = GuildSettings {
            guild_id,
            volume_pct,
            updated_at: Utc::now(),
        };
        self.save(&settings).await?;
        self.guilds.insert(guild_id, settings);

        debug!("💾 Volumen {}% guardado para guild {}", volume_pct, guild_id);
        Ok(())
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }

    // Métodos privados

    async fn save(&self, settings: &GuildSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.file_path(settings.guild_id), content).await?;
        Ok(())
    }

    async fn load_all(&mut self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("guilds")).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let parsed = async {
                let content = fs::read_to_string(&path).await?;
                anyhow::Ok(serde_json::from_str::<GuildSettings>(&content)?)
            };
            match parsed.await {
                Ok(settings) => {
                    self.guilds.insert(settings.guild_id, settings);
                    loaded_count += 1;
                }
                Err(e) => warn!("Error cargando {}: {}", path.display(), e),
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargadas {} configuraciones de servidor", loaded_count);
        }
        Ok(())
    }

    fn file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join("guilds").join(format!("guild_{}.json", guild_id))
    }
}
