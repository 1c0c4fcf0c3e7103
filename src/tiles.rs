use crate::error::{Error, Result};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const TILE_CONTENT_TYPE: &str = "image/png";

/// Parses a non-empty run of ASCII digits; `str::parse` alone would accept a
/// leading `+`.
fn parse_index<T: std::str::FromStr>(digits: &str) -> Option<T> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileCoordinate {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoordinate {
    /// Parses the route segments `{z}`, `{x}` and `{y}.png`.
    pub fn parse(z: &str, x: &str, y_file: &str) -> Result<Self> {
        let invalid = || Error::InvalidTileCoordinate(format!("{z}/{x}/{y_file}"));
        let y = y_file.strip_suffix(".png").ok_or_else(invalid)?;
        Ok(Self {
            z: parse_index(z).ok_or_else(invalid)?,
            x: parse_index(x).ok_or_else(invalid)?,
            y: parse_index(y).ok_or_else(invalid)?,
        })
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.z.to_string())
            .join(self.x.to_string())
            .join(format!("{}.png", self.y))
    }
}

/// Read-only view of a generated tile tree.
#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
}

impl TileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn get_tile(&self, coord: TileCoordinate) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(coord.relative_path());
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No tile at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::tests::test_dir;

    #[test]
    fn test_parse_coordinate() {
        let coord = TileCoordinate::parse("3", "4", "2.png").unwrap();
        assert_eq!(coord, TileCoordinate { z: 3, x: 4, y: 2 });
        assert_eq!(coord.relative_path(), PathBuf::from("3/4/2.png"));

        for (z, x, y) in [
            ("a", "4", "2.png"),
            ("3", "-1", "2.png"),
            ("3", "4", "2.jpg"),
            ("3", "4", "2"),
            ("3", "4", "../2.png"),
            ("300", "4", "2.png"),
            ("3", "4", "+2.png"),
            ("+3", "4", "2.png"),
            ("3", "4", ".png"),
            ("3", "4", "2.png.png"),
            ("3", "4", "99999999999.png"),
        ] {
            assert!(
                matches!(
                    TileCoordinate::parse(z, x, y),
                    Err(Error::InvalidTileCoordinate(_))
                ),
                "{z}/{x}/{y}"
            );
        }
    }

    #[tokio::test]
    async fn test_get_tile() {
        let root = test_dir("tile_store");
        let store = TileStore::new(&root);
        let coord = TileCoordinate { z: 1, x: 0, y: 1 };
        assert_eq!(store.get_tile(coord).await.unwrap(), None);

        let bytes = vec![0x89, b'P', b'N', b'G', 0, 1, 2];
        std::fs::create_dir_all(root.join("1/0")).unwrap();
        std::fs::write(root.join("1/0/1.png"), &bytes).unwrap();
        assert_eq!(store.get_tile(coord).await.unwrap(), Some(bytes));
    }

    #[tokio::test]
    async fn test_get_tile_io_error() {
        let root = test_dir("tile_store_dir");
        // A directory where the tile file should be cannot be read as one.
        std::fs::create_dir_all(root.join("0/0/0.png")).unwrap();
        let store = TileStore::new(&root);
        let err = store
            .get_tile(TileCoordinate { z: 0, x: 0, y: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
