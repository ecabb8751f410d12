pub mod rss;
pub mod youtube;

pub use rss::RssProducer;
pub use youtube::YouTubeProducer;
