//! Tile provider configuration.

use std::collections::BTreeMap;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::mercator::{quadkey, TileId};

fn default_tile_size() -> u32 {
    256
}

fn default_max_zoom() -> u8 {
    19
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "User-Agent".to_owned(),
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned(),
    )])
}

/// Where map tiles come from: a named set of mirror URL templates plus the tile
/// geometry and request headers needed to use them.
///
/// Templates may contain the `{zoom}`, `{row}`, `{col}` and `{quadkey}`
/// placeholders. The provider name scopes the persistent tile store, so two
/// providers never mix their cached tiles.
///
/// Providers deserialize from configuration files; unknown fields are
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TileProvider {
    pub name: String,

    /// Mirror URL templates. One is chosen at random per request, spreading
    /// load across mirror hosts.
    pub urls: Vec<String>,

    #[serde(default = "default_tile_size")]
    pub tile_width: u32,

    #[serde(default = "default_tile_size")]
    pub tile_height: u32,

    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,

    /// Headers sent with every tile request.
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
}

impl TileProvider {
    /// Tile dimensions in pixels, `(width, height)`.
    pub fn tile_size(&self) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }

    /// Build the request URL for a tile, choosing one mirror at random.
    pub fn tile_url(&self, tile_id: TileId) -> String {
        let template = self
            .urls
            .choose(&mut rand::rng())
            .map_or("", |url| url.as_str());
        expand(template, tile_id)
    }

    /// <https://www.openstreetmap.org/about>
    pub fn openstreetmap() -> Self {
        Self {
            name: "openstreetmap".to_owned(),
            urls: vec![
                "https://a.tile.openstreetmap.org/{zoom}/{col}/{row}.png".to_owned(),
                "https://b.tile.openstreetmap.org/{zoom}/{col}/{row}.png".to_owned(),
                "https://c.tile.openstreetmap.org/{zoom}/{col}/{row}.png".to_owned(),
            ],
            tile_width: default_tile_size(),
            tile_height: default_tile_size(),
            max_zoom: default_max_zoom(),
            headers: default_headers(),
        }
    }

    /// Google's road map layer.
    pub fn google_maps() -> Self {
        Self {
            name: "google-map".to_owned(),
            urls: google_urls('m'),
            tile_width: default_tile_size(),
            tile_height: default_tile_size(),
            max_zoom: default_max_zoom(),
            headers: default_headers(),
        }
    }

    /// Google's satellite layer.
    pub fn google_satellite() -> Self {
        Self {
            name: "google-satellite".to_owned(),
            urls: google_urls('s'),
            tile_width: default_tile_size(),
            tile_height: default_tile_size(),
            max_zoom: default_max_zoom(),
            headers: default_headers(),
        }
    }
}

fn google_urls(layer: char) -> Vec<String> {
    (0..4)
        .map(|mirror| {
            format!(
                "https://mt{mirror}.google.com/vt/lyrs={layer}&hl=en&x={{col}}&y={{row}}&z={{zoom}}&s=Ga"
            )
        })
        .collect()
}

fn expand(template: &str, tile_id: TileId) -> String {
    let mut url = template
        .replace("{zoom}", &tile_id.zoom.to_string())
        .replace("{row}", &tile_id.row.to_string())
        .replace("{col}", &tile_id.col.to_string());
    if url.contains("{quadkey}") {
        url = url.replace("{quadkey}", &quadkey(tile_id));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_expanded() {
        let provider = TileProvider {
            name: "test".to_owned(),
            urls: vec!["https://tiles.test/{zoom}/{col}/{row}.png".to_owned()],
            tile_width: 256,
            tile_height: 256,
            max_zoom: 19,
            headers: BTreeMap::new(),
        };

        assert_eq!(
            "https://tiles.test/3/1/2.png",
            provider.tile_url(TileId::new(3, 2, 1))
        );
    }

    #[test]
    fn quadkey_placeholder_is_expanded() {
        let provider = TileProvider {
            name: "bing-like".to_owned(),
            urls: vec!["https://tiles.test/{quadkey}".to_owned()],
            tile_width: 256,
            tile_height: 256,
            max_zoom: 19,
            headers: BTreeMap::new(),
        };

        assert_eq!(
            "https://tiles.test/213",
            provider.tile_url(TileId::new(3, 5, 3))
        );
    }

    #[test]
    fn every_request_uses_one_of_the_mirrors() {
        let provider = TileProvider::openstreetmap();
        for _ in 0..32 {
            let url = provider.tile_url(TileId::new(1, 0, 1));
            assert!(
                provider
                    .urls
                    .iter()
                    .any(|template| url == expand(template, TileId::new(1, 0, 1))),
                "unexpected url: {url}"
            );
        }
    }

    #[test]
    fn unknown_configuration_fields_are_rejected() {
        let config = r#"{
            "name": "test",
            "urls": ["https://tiles.test/{zoom}/{col}/{row}.png"],
            "tile_wdith": 256
        }"#;
        assert!(serde_json::from_str::<TileProvider>(config).is_err());
    }

    #[test]
    fn omitted_fields_fall_back_to_defaults() {
        let config = r#"{
            "name": "test",
            "urls": ["https://tiles.test/{zoom}/{col}/{row}.png"]
        }"#;
        let provider: TileProvider = serde_json::from_str(config).unwrap();
        assert_eq!((256, 256), provider.tile_size());
        assert_eq!(19, provider.max_zoom);
        assert!(provider.headers.contains_key("User-Agent"));
    }
}
